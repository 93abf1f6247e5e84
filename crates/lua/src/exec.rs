//! Program execution and the `ExecHooks` seam.
//!
//! A compiled description file runs with four registration functions in its
//! environment: `target{}`, `glob{}`, `subpackages{}` and `import()`. All
//! four call back into an [`ExecHooks`] implementation supplied by the
//! loader, so this crate knows nothing about packages, globbers or the
//! dependency graph.
//!
//! Imported modules evaluate in their own restricted environment that keeps
//! `target`/`glob`/`subpackages` (macros need them) but not `import`:
//! transitive module loading is the loader's problem, not the runtime's.

use std::cell::RefCell;
use std::collections::BTreeMap;

use mlua::prelude::*;

use crate::chunk::compile_chunk;
use crate::runtime::base_environment;
use crate::value::Value;

/// A target registration as it crosses from Lua into the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDecl {
  pub name: String,
  pub kind: String,
  pub attrs: BTreeMap<String, Value>,
}

/// Arguments of one `glob{}`/`subpackages{}` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobArgs {
  pub include: Vec<String>,
  pub exclude: Vec<String>,
  pub dirs: bool,
  pub allow_empty: bool,
}

/// The source of a module resolved ahead of execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleChunk {
  /// Display name for chunk naming and error messages.
  pub name: String,
  pub source: String,
}

/// The loader-side callbacks available during program execution.
pub trait ExecHooks {
  fn register_target(&mut self, decl: TargetDecl) -> Result<(), String>;
  fn glob(&mut self, args: GlobArgs) -> Result<Vec<String>, String>;
  fn subpackages(&mut self, args: GlobArgs) -> Result<Vec<String>, String>;
  /// Hand out the pre-fetched source of a module named by a literal
  /// `import()` argument.
  fn module_source(&mut self, path: &str) -> Result<ModuleChunk, String>;
}

impl GlobArgs {
  /// Parse the Lua-side argument: either a single pattern string or a table
  /// of positional patterns with optional `include`, `exclude`, `dirs` and
  /// `allow_empty` members.
  pub fn from_lua_value(value: &LuaValue) -> Result<GlobArgs, String> {
    let mut args = GlobArgs {
      allow_empty: true,
      ..GlobArgs::default()
    };
    match value {
      LuaValue::String(s) => {
        args
          .include
          .push(s.to_str().map_err(|_| "pattern is not valid UTF-8".to_string())?.to_string());
        Ok(args)
      }
      LuaValue::Table(table) => {
        for i in 1..=table.raw_len() {
          let item: LuaValue = table.raw_get(i).map_err(|e| e.to_string())?;
          args.include.push(expect_pattern(&item)?);
        }
        let include: LuaValue = table.raw_get("include").map_err(|e| e.to_string())?;
        if !include.is_nil() {
          args.include.extend(pattern_list(&include)?);
        }
        let exclude: LuaValue = table.raw_get("exclude").map_err(|e| e.to_string())?;
        if !exclude.is_nil() {
          args.exclude.extend(pattern_list(&exclude)?);
        }
        let dirs: LuaValue = table.raw_get("dirs").map_err(|e| e.to_string())?;
        if let LuaValue::Boolean(b) = dirs {
          args.dirs = b;
        }
        let allow_empty: LuaValue = table.raw_get("allow_empty").map_err(|e| e.to_string())?;
        if let LuaValue::Boolean(b) = allow_empty {
          args.allow_empty = b;
        }
        Ok(args)
      }
      other => Err(format!(
        "glob expects a pattern string or a table of patterns, got {}",
        other.type_name()
      )),
    }
  }
}

fn expect_pattern(value: &LuaValue) -> Result<String, String> {
  match value {
    LuaValue::String(s) => Ok(
      s.to_str()
        .map_err(|_| "pattern is not valid UTF-8".to_string())?
        .to_string(),
    ),
    other => Err(format!("glob patterns must be strings, got {}", other.type_name())),
  }
}

fn pattern_list(value: &LuaValue) -> Result<Vec<String>, String> {
  match value {
    LuaValue::Table(table) => {
      let mut out = Vec::with_capacity(table.raw_len());
      for i in 1..=table.raw_len() {
        let item: LuaValue = table.raw_get(i).map_err(|e| e.to_string())?;
        out.push(expect_pattern(&item)?);
      }
      Ok(out)
    }
    other => Err(format!("expected a list of patterns, got {}", other.type_name())),
  }
}

fn parse_target_decl(table: &LuaTable) -> Result<TargetDecl, String> {
  let mut name = None;
  let mut kind = None;
  let mut attrs = BTreeMap::new();

  for pair in table.clone().pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair.map_err(|e| e.to_string())?;
    let key = match key {
      LuaValue::String(s) => s
        .to_str()
        .map_err(|_| "target field names must be valid UTF-8".to_string())?
        .to_string(),
      other => {
        return Err(format!(
          "target fields must be named, got a {} key",
          other.type_name()
        ));
      }
    };
    match key.as_str() {
      "name" => match &value {
        LuaValue::String(s) => {
          name = Some(
            s.to_str()
              .map_err(|_| "target name is not valid UTF-8".to_string())?
              .to_string(),
          );
        }
        other => return Err(format!("target 'name' must be a string, got {}", other.type_name())),
      },
      "kind" => match &value {
        LuaValue::String(s) => {
          kind = Some(
            s.to_str()
              .map_err(|_| "target kind is not valid UTF-8".to_string())?
              .to_string(),
          );
        }
        other => return Err(format!("target 'kind' must be a string, got {}", other.type_name())),
      },
      _ => {
        // Unsupported values (functions as generators) are dropped rather
        // than failing the whole registration.
        if let Ok(value) = Value::from_lua_value(&value) {
          attrs.insert(key, value);
        }
      }
    }
  }

  Ok(TargetDecl {
    name: name.ok_or_else(|| "target requires a string 'name'".to_string())?,
    kind: kind.ok_or_else(|| "target requires a string 'kind'".to_string())?,
    attrs,
  })
}

/// Run a compiled program with the registration functions bound to `hooks`.
///
/// Any error raised by the program (or by a hook) is returned as the Lua
/// error; the caller decides how it degrades the package.
pub fn execute_program(
  lua: &Lua,
  program: &LuaFunction,
  env: &LuaTable,
  hooks: &mut dyn ExecHooks,
) -> LuaResult<()> {
  let hooks = RefCell::new(hooks);

  lua.scope(|scope| {
    let target_fn = scope.create_function(|_, table: LuaTable| {
      let decl = parse_target_decl(&table).map_err(LuaError::external)?;
      hooks.borrow_mut().register_target(decl).map_err(LuaError::external)
    })?;

    let glob_fn = scope.create_function(|_, value: LuaValue| {
      let args = GlobArgs::from_lua_value(&value).map_err(LuaError::external)?;
      hooks.borrow_mut().glob(args).map_err(LuaError::external)
    })?;

    let subpackages_fn = scope.create_function(|_, value: LuaValue| {
      let args = GlobArgs::from_lua_value(&value).map_err(LuaError::external)?;
      hooks.borrow_mut().subpackages(args).map_err(LuaError::external)
    })?;

    let module_cache = lua.create_table()?;
    let module_hooks = (target_fn.clone(), glob_fn.clone(), subpackages_fn.clone());
    let hooks_ref = &hooks;
    let import_fn = scope.create_function(move |lua, path: String| {
      let cached: LuaValue = module_cache.raw_get(path.as_str())?;
      if !cached.is_nil() {
        return Ok(cached);
      }
      let module = hooks_ref
        .borrow_mut()
        .module_source(&path)
        .map_err(LuaError::external)?;

      let module_env = base_environment(lua)?;
      module_env.set("target", module_hooks.0.clone())?;
      module_env.set("glob", module_hooks.1.clone())?;
      module_env.set("subpackages", module_hooks.2.clone())?;

      let func = match compile_chunk(lua, &module.source, &module.name, &module_env)? {
        Ok(func) => func,
        Err(errors) => {
          let text = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
          return Err(LuaError::external(format!("error in module '{}': {}", path, text)));
        }
      };
      let value: LuaValue = func.call(())?;
      if value.is_nil() {
        return Err(LuaError::external(format!(
          "module '{}' did not return a value",
          path
        )));
      }
      module_cache.raw_set(path.as_str(), value.clone())?;
      Ok(value)
    })?;

    env.set("target", target_fn)?;
    env.set("glob", glob_fn)?;
    env.set("subpackages", subpackages_fn)?;
    env.set("import", import_fn)?;

    program.call::<()>(())
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunk::compile_chunk;
  use crate::runtime::{base_environment, sandboxed_lua};

  #[derive(Default)]
  struct RecordingHooks {
    targets: Vec<TargetDecl>,
    globs: Vec<GlobArgs>,
    modules: BTreeMap<String, String>,
  }

  impl ExecHooks for RecordingHooks {
    fn register_target(&mut self, decl: TargetDecl) -> Result<(), String> {
      if self.targets.iter().any(|t| t.name == decl.name) {
        return Err(format!("duplicate target '{}'", decl.name));
      }
      self.targets.push(decl);
      Ok(())
    }

    fn glob(&mut self, args: GlobArgs) -> Result<Vec<String>, String> {
      self.globs.push(args);
      Ok(vec!["a.c".to_string(), "b.c".to_string()])
    }

    fn subpackages(&mut self, args: GlobArgs) -> Result<Vec<String>, String> {
      self.globs.push(args);
      Ok(vec![])
    }

    fn module_source(&mut self, path: &str) -> Result<ModuleChunk, String> {
      match self.modules.get(path) {
        Some(source) => Ok(ModuleChunk {
          name: path.to_string(),
          source: source.clone(),
        }),
        None => Err(format!("no module '{}'", path)),
      }
    }
  }

  fn run(source: &str, hooks: &mut RecordingHooks) -> LuaResult<()> {
    let lua = sandboxed_lua().unwrap();
    let env = base_environment(&lua).unwrap();
    let func = compile_chunk(&lua, source, "PKG.lua", &env).unwrap().unwrap();
    execute_program(&lua, &func, &env, hooks)
  }

  #[test]
  fn registers_targets_with_attrs() {
    let mut hooks = RecordingHooks::default();
    run(
      r#"target { name = "hello", kind = "cc_binary", srcs = { "main.c" }, opt = true }"#,
      &mut hooks,
    )
    .unwrap();

    assert_eq!(hooks.targets.len(), 1);
    let target = &hooks.targets[0];
    assert_eq!(target.name, "hello");
    assert_eq!(target.kind, "cc_binary");
    assert_eq!(
      target.attrs.get("srcs"),
      Some(&Value::List(vec![Value::String("main.c".to_string())]))
    );
  }

  #[test]
  fn glob_results_usable_from_lua() {
    let mut hooks = RecordingHooks::default();
    run(
      r#"
        local srcs = glob { "*.c", exclude = { "gen_*.c" }, allow_empty = false }
        target { name = "lib", kind = "cc_library", srcs = srcs }
      "#,
      &mut hooks,
    )
    .unwrap();

    assert_eq!(hooks.globs.len(), 1);
    let args = &hooks.globs[0];
    assert_eq!(args.include, vec!["*.c"]);
    assert_eq!(args.exclude, vec!["gen_*.c"]);
    assert!(!args.allow_empty);

    assert_eq!(
      hooks.targets[0].attrs.get("srcs"),
      Some(&Value::List(vec![
        Value::String("a.c".to_string()),
        Value::String("b.c".to_string())
      ]))
    );
  }

  #[test]
  fn duplicate_target_aborts_execution() {
    let mut hooks = RecordingHooks::default();
    let err = run(
      r#"
        target { name = "x", kind = "a" }
        target { name = "x", kind = "b" }
      "#,
      &mut hooks,
    )
    .unwrap_err();
    assert!(err.to_string().contains("duplicate target 'x'"));
    assert_eq!(hooks.targets.len(), 1);
  }

  #[test]
  fn imported_module_macros_register_targets() {
    let mut hooks = RecordingHooks::default();
    hooks.modules.insert(
      "//tools/defs.lua".to_string(),
      r#"
        return {
          pair = function(args)
            target { name = args.name, kind = "pair" }
            target { name = args.name .. "_test", kind = "pair_test" }
          end,
        }
      "#
      .to_string(),
    );

    run(
      r#"
        local defs = import("//tools/defs.lua")
        defs.pair { name = "demo" }
      "#,
      &mut hooks,
    )
    .unwrap();

    let names: Vec<&str> = hooks.targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["demo", "demo_test"]);
  }

  #[test]
  fn import_is_cached_per_execution() {
    let mut hooks = RecordingHooks::default();
    hooks.modules.insert(
      "m.lua".to_string(),
      "target { name = 'from_module', kind = 'once' }\nreturn { ok = true }".to_string(),
    );

    run(
      r#"
        local a = import("m.lua")
        local b = import("m.lua")
        assert(a.ok and b.ok)
      "#,
      &mut hooks,
    )
    .unwrap();

    // The module body ran once despite two imports.
    assert_eq!(hooks.targets.len(), 1);
  }

  #[test]
  fn modules_cannot_import() {
    let mut hooks = RecordingHooks::default();
    hooks
      .modules
      .insert("m.lua".to_string(), "return import('other.lua')".to_string());

    let err = run(r#"import("m.lua")"#, &mut hooks).unwrap_err();
    assert!(err.to_string().contains("import"));
  }

  #[test]
  fn missing_name_is_an_error() {
    let mut hooks = RecordingHooks::default();
    let err = run(r#"target { kind = "cc_binary" }"#, &mut hooks).unwrap_err();
    assert!(err.to_string().contains("requires a string 'name'"));
  }
}
