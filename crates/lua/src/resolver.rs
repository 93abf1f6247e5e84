//! The constrained runtime for user-supplied file resolvers.
//!
//! A resolver is a Lua script that returns a function `(ctx, path) ->
//! nil | boolean | string`. It runs during the loading phase only, in its
//! own sandboxed VM with none of the description-file registration
//! functions, and answers existence probes and content fetches for paths
//! the local disk does not carry.
//!
//! The `ctx` argument exposes the workspace root, the attributes declared
//! on the resolver in `workspace.lua`, and a small set of filesystem
//! helpers (`read`, `write`, `symlink`, `template`, `delete`) rooted at the
//! workspace.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use mlua::prelude::*;

use crate::chunk::compile_chunk;
use crate::runtime::{base_environment, sandboxed_lua};
use crate::value::Value;

/// What the resolver said about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverOutcome {
  /// The path does not exist (or the resolver declined to answer).
  Missing,
  /// The path exists; no content was produced.
  Exists,
  /// The path exists and these are its contents.
  Content(Vec<u8>),
}

/// One resolver invocation.
#[derive(Debug)]
pub struct ResolverRequest<'a> {
  pub workspace_root: &'a Path,
  pub attrs: &'a BTreeMap<String, Value>,
  /// Workspace-relative path being asked about.
  pub path: &'a str,
}

/// Load the resolver script and invoke it for one path.
///
/// Every failure mode (syntax error in the script, the script not returning
/// a function, a runtime error inside the callback) is an `Err`; callers
/// are expected to degrade these to "missing" rather than fail the load.
pub fn run_resolver(script_source: &str, script_name: &str, req: &ResolverRequest<'_>) -> LuaResult<ResolverOutcome> {
  let lua = sandboxed_lua()?;
  let env = base_environment(&lua)?;

  let func = match compile_chunk(&lua, script_source, script_name, &env)? {
    Ok(func) => func,
    Err(errors) => {
      let text = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
      return Err(LuaError::external(format!("resolver script failed to parse: {}", text)));
    }
  };

  let callback: LuaValue = func.call(())?;
  let LuaValue::Function(callback) = callback else {
    return Err(LuaError::external("resolver script must return a function"));
  };

  let ctx = build_ctx(&lua, req)?;
  let result: LuaValue = callback.call((ctx, req.path))?;

  match result {
    LuaValue::Nil | LuaValue::Boolean(false) => Ok(ResolverOutcome::Missing),
    LuaValue::Boolean(true) => Ok(ResolverOutcome::Exists),
    LuaValue::String(s) => Ok(ResolverOutcome::Content(s.as_bytes().to_vec())),
    other => Err(LuaError::external(format!(
      "resolver returned a {}; expected nil, boolean or string",
      other.type_name()
    ))),
  }
}

fn build_ctx(lua: &Lua, req: &ResolverRequest<'_>) -> LuaResult<LuaTable> {
  let ctx = lua.create_table()?;
  ctx.set("root", req.workspace_root.to_string_lossy().as_ref())?;

  let attrs = lua.create_table()?;
  for (key, value) in req.attrs {
    attrs.set(key.as_str(), value.to_lua(lua)?)?;
  }
  ctx.set("attrs", attrs)?;

  let root = req.workspace_root.to_path_buf();

  let read_root = root.clone();
  ctx.set(
    "read",
    lua.create_function(move |_, (_this, path): (LuaTable, String)| {
      let path = rooted(&read_root, &path)?;
      match fs::read_to_string(&path) {
        Ok(content) => Ok(Some(content)),
        Err(_) => Ok(None),
      }
    })?,
  )?;

  let write_root = root.clone();
  ctx.set(
    "write",
    lua.create_function(move |_, (_this, path, content): (LuaTable, String, LuaString)| {
      let path = rooted(&write_root, &path)?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(LuaError::external)?;
      }
      fs::write(&path, &*content.as_bytes()).map_err(LuaError::external)
    })?,
  )?;

  let symlink_root = root.clone();
  ctx.set(
    "symlink",
    lua.create_function(move |_, (_this, target, link): (LuaTable, String, String)| {
      let target = rooted(&symlink_root, &target)?;
      let link = rooted(&symlink_root, &link)?;
      if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(LuaError::external)?;
      }
      make_symlink(&target, &link).map_err(LuaError::external)
    })?,
  )?;

  let template_root = root.clone();
  ctx.set(
    "template",
    lua.create_function(move |_, (_this, path, subs): (LuaTable, String, LuaTable)| {
      let path = rooted(&template_root, &path)?;
      let mut content = fs::read_to_string(&path).map_err(LuaError::external)?;
      for pair in subs.pairs::<String, String>() {
        let (key, value) = pair?;
        content = content.replace(&format!("{{{}}}", key), &value);
      }
      Ok(content)
    })?,
  )?;

  let delete_root = root;
  ctx.set(
    "delete",
    lua.create_function(move |_, (_this, path): (LuaTable, String)| {
      let path = rooted(&delete_root, &path)?;
      match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(_) => Ok(false),
      }
    })?,
  )?;

  Ok(ctx)
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
  std::os::windows::fs::symlink_file(target, link)
}

/// Join a workspace-relative path onto the root, refusing escapes.
fn rooted(root: &Path, rel: &str) -> LuaResult<PathBuf> {
  let rel_path = Path::new(rel);
  if rel_path.is_absolute() {
    return Err(LuaError::external(format!("path '{}' must be workspace-relative", rel)));
  }
  for component in rel_path.components() {
    match component {
      Component::Normal(_) | Component::CurDir => {}
      _ => {
        return Err(LuaError::external(format!(
          "path '{}' may not leave the workspace",
          rel
        )));
      }
    }
  }
  Ok(root.join(rel_path))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn request<'a>(root: &'a Path, attrs: &'a BTreeMap<String, Value>, path: &'a str) -> ResolverRequest<'a> {
    ResolverRequest {
      workspace_root: root,
      attrs,
      path,
    }
  }

  #[test]
  fn attrs_drive_existence_answers() {
    let dir = TempDir::new().unwrap();
    let mut attrs = BTreeMap::new();
    attrs.insert(
      "files".to_string(),
      Value::List(vec![Value::String("pkg/PKG.lua".to_string())]),
    );

    let script = r#"
      return function(ctx, path)
        for _, known in ipairs(ctx.attrs.files) do
          if known == path then
            return true
          end
        end
        return false
      end
    "#;

    let hit = run_resolver(script, "resolver.lua", &request(dir.path(), &attrs, "pkg/PKG.lua")).unwrap();
    assert_eq!(hit, ResolverOutcome::Exists);

    let miss = run_resolver(script, "resolver.lua", &request(dir.path(), &attrs, "other/PKG.lua")).unwrap();
    assert_eq!(miss, ResolverOutcome::Missing);
  }

  #[test]
  fn string_results_are_contents() {
    let dir = TempDir::new().unwrap();
    let attrs = BTreeMap::new();
    let script = r#"
      return function(ctx, path)
        return "target { name = 'x', kind = 'gen' }"
      end
    "#;

    let outcome = run_resolver(script, "resolver.lua", &request(dir.path(), &attrs, "pkg/PKG.lua")).unwrap();
    let ResolverOutcome::Content(bytes) = outcome else {
      panic!("expected content");
    };
    assert!(String::from_utf8(bytes).unwrap().contains("name = 'x'"));
  }

  #[test]
  fn ctx_read_and_template_helpers() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("greeting.in"), "hello {who}").unwrap();
    let attrs = BTreeMap::new();

    let script = r#"
      return function(ctx, path)
        local expanded = ctx:template("greeting.in", { who = "world" })
        ctx:write("generated.txt", expanded)
        return ctx:read("generated.txt")
      end
    "#;

    let outcome = run_resolver(script, "resolver.lua", &request(dir.path(), &attrs, "x")).unwrap();
    assert_eq!(outcome, ResolverOutcome::Content(b"hello world".to_vec()));
  }

  #[test]
  fn escaping_the_workspace_is_refused() {
    let dir = TempDir::new().unwrap();
    let attrs = BTreeMap::new();
    let script = r#"
      return function(ctx, path)
        return ctx:read("../outside.txt")
      end
    "#;

    let err = run_resolver(script, "resolver.lua", &request(dir.path(), &attrs, "x")).unwrap_err();
    assert!(err.to_string().contains("may not leave the workspace"));
  }

  #[test]
  fn runtime_errors_surface_to_the_caller() {
    let dir = TempDir::new().unwrap();
    let attrs = BTreeMap::new();
    let script = "return function(ctx, path) error('resolver bug') end";

    let err = run_resolver(script, "resolver.lua", &request(dir.path(), &attrs, "x")).unwrap_err();
    assert!(err.to_string().contains("resolver bug"));
  }

  #[test]
  fn non_function_script_is_an_error() {
    let dir = TempDir::new().unwrap();
    let attrs = BTreeMap::new();

    let err = run_resolver("return 42", "resolver.lua", &request(dir.path(), &attrs, "x")).unwrap_err();
    assert!(err.to_string().contains("must return a function"));
  }
}
