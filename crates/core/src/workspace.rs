//! The workspace configuration chain.
//!
//! `workspace.lua` at the workspace root declares, optionally, a virtual
//! file resolver, a prelude module, and external repository roots. A
//! configuration file may `extends` another, forming a chain of graph
//! nodes; consumers walk the whole chain and the last declaration of each
//! item wins. Walking suspends while any link is unavailable rather than
//! guessing.

use std::collections::BTreeMap;
use std::sync::Arc;

use loadstone_lua::chunk::compile_chunk;
use loadstone_lua::runtime::{base_environment, sandboxed_lua};
use loadstone_lua::value::Value;
use mlua::prelude::*;

use crate::consts::{MAX_CONFIG_CHAIN, WORKSPACE_FILE_NAME};
use crate::error::{LoadError, LoadErrorKind};
use crate::graph::{GraphEnv, GraphKey, GraphValue, Outcome};
use crate::vfs::{Root, RootedPath};

/// A resolver declaration: the script that answers virtual file queries
/// plus the attributes handed to it on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverDecl {
  /// Workspace-relative path of the resolver script.
  pub script: String,
  pub attrs: BTreeMap<String, Value>,
}

/// One link of the configuration chain, as written in its file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceConfig {
  pub resolver: Option<ResolverDecl>,
  /// Label of the prelude module merged into every package environment.
  pub prelude: Option<String>,
  /// External repository name to workspace-relative directory.
  pub repos: BTreeMap<String, String>,
  /// Workspace-relative path of the next chain link.
  pub extends: Option<String>,
}

/// The merged view of the whole chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceResolved {
  pub resolver: Option<ResolverDecl>,
  pub prelude: Option<String>,
  pub repos: BTreeMap<String, String>,
}

/// Node function for one chain link.
pub fn workspace_config_fn(
  root: &Root,
  index: u32,
  env: &mut dyn GraphEnv,
) -> Result<Outcome<GraphValue>, LoadError> {
  let rel = if index == 0 {
    WORKSPACE_FILE_NAME.to_string()
  } else {
    // The file for link N comes from link N-1's `extends`.
    let previous = match env.lookup(&GraphKey::WorkspaceConfig(index - 1))? {
      Outcome::Pending => return Ok(Outcome::Pending),
      Outcome::Ready(value) => value,
    };
    let previous = previous
      .as_workspace_config()
      .cloned()
      .ok_or_else(|| internal("workspace config chain produced a foreign value"))?;
    match &previous.extends {
      Some(path) => path.clone(),
      None => {
        return Err(LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
          "workspace configuration chain has no link {}",
          index
        ))));
      }
    }
  };

  let rooted = RootedPath::new(root.clone(), rel.clone());
  let state = match env.lookup(&GraphKey::FileState(rooted.clone()))? {
    Outcome::Pending => return Ok(Outcome::Pending),
    Outcome::Ready(value) => value,
  };
  let exists = state.as_file_state().map(|s| s.exists()).unwrap_or(false);
  if !exists {
    if index == 0 {
      // No workspace.lua at all: an empty configuration, not an error.
      return Ok(Outcome::Ready(GraphValue::WorkspaceConfig(Arc::new(
        WorkspaceConfig::default(),
      ))));
    }
    return Err(LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
      "workspace configuration '{}' extends missing file '{}'",
      WORKSPACE_FILE_NAME, rel
    ))));
  }

  let source = std::fs::read_to_string(rooted.as_path())
    .map_err(|err| LoadError::from_io(&err, &format!("reading '{}'", rel)))?;
  let config = parse_config(&rel, &source)?;
  Ok(Outcome::Ready(GraphValue::WorkspaceConfig(Arc::new(config))))
}

/// Walk and merge the whole chain. Suspends while any link is missing.
pub fn resolved(env: &mut dyn GraphEnv) -> Result<Outcome<Arc<WorkspaceResolved>>, LoadError> {
  let mut merged = WorkspaceResolved::default();
  for index in 0..MAX_CONFIG_CHAIN {
    let config = match env.lookup(&GraphKey::WorkspaceConfig(index))? {
      Outcome::Pending => return Ok(Outcome::Pending),
      Outcome::Ready(value) => value,
    };
    let config = config
      .as_workspace_config()
      .cloned()
      .ok_or_else(|| internal("workspace config chain produced a foreign value"))?;

    if let Some(resolver) = &config.resolver {
      merged.resolver = Some(resolver.clone());
    }
    if let Some(prelude) = &config.prelude {
      merged.prelude = Some(prelude.clone());
    }
    for (name, path) in &config.repos {
      merged.repos.insert(name.clone(), path.clone());
    }
    if config.extends.is_none() {
      return Ok(Outcome::Ready(Arc::new(merged)));
    }
  }
  Err(LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
    "workspace configuration chain exceeds {} links",
    MAX_CONFIG_CHAIN
  ))))
}

fn internal(message: &str) -> LoadError {
  LoadError::persistent(LoadErrorKind::Io(message.to_string()))
}

fn config_error(file: &str, message: impl std::fmt::Display) -> LoadError {
  LoadError::persistent(LoadErrorKind::BuildFileContainsErrors(format!(
    "error in '{}': {}",
    file, message
  )))
}

fn parse_config(file: &str, source: &str) -> Result<WorkspaceConfig, LoadError> {
  let lua = sandboxed_lua().map_err(|err| config_error(file, err))?;
  let env = base_environment(&lua).map_err(|err| config_error(file, err))?;
  let func = compile_chunk(&lua, source, file, &env)
    .map_err(|err| config_error(file, err))?
    .map_err(|errors| {
      let text = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
      config_error(file, text)
    })?;

  let result: LuaValue = func.call(()).map_err(|err| config_error(file, err))?;
  if result.is_nil() {
    return Ok(WorkspaceConfig::default());
  }
  let value = Value::from_lua_value(&result).map_err(|err| config_error(file, err))?;
  let Value::Table(map) = value else {
    return Err(config_error(file, "workspace configuration must return a table"));
  };

  let mut config = WorkspaceConfig::default();
  for (key, value) in map {
    match key.as_str() {
      "resolver" => config.resolver = Some(parse_resolver(file, value)?),
      "prelude" => match value {
        Value::String(label) => config.prelude = Some(label),
        _ => return Err(config_error(file, "'prelude' must be a label string")),
      },
      "repos" => match value {
        Value::Table(repos) => {
          for (name, path) in repos {
            match path {
              Value::String(path) => {
                config.repos.insert(name, path);
              }
              _ => return Err(config_error(file, "'repos' entries must be path strings")),
            }
          }
        }
        _ => return Err(config_error(file, "'repos' must be a table")),
      },
      "extends" => match value {
        Value::String(path) => config.extends = Some(path),
        _ => return Err(config_error(file, "'extends' must be a path string")),
      },
      other => {
        return Err(config_error(
          file,
          format!("unknown workspace configuration field '{}'", other),
        ));
      }
    }
  }
  Ok(config)
}

fn parse_resolver(file: &str, value: Value) -> Result<ResolverDecl, LoadError> {
  let Value::Table(mut map) = value else {
    return Err(config_error(file, "'resolver' must be a table"));
  };
  let script = match map.remove("script") {
    Some(Value::String(script)) => script,
    _ => return Err(config_error(file, "'resolver' requires a 'script' path string")),
  };
  let attrs = match map.remove("attrs") {
    None => BTreeMap::new(),
    Some(Value::Table(attrs)) => attrs,
    Some(_) => return Err(config_error(file, "'resolver.attrs' must be a table")),
  };
  if let Some(unknown) = map.keys().next() {
    return Err(config_error(
      file,
      format!("unknown resolver field '{}'", unknown),
    ));
  }
  Ok(ResolverDecl { script, attrs })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::StaticEnv;
  use crate::vfs::FileState;

  fn file_state_key(root: &Root, rel: &str) -> GraphKey {
    GraphKey::FileState(RootedPath::new(root.clone(), rel))
  }

  mod parsing {
    use super::*;

    #[test]
    fn full_configuration() {
      let config = parse_config(
        "workspace.lua",
        r#"
          return {
            resolver = { script = "tools/resolver.lua", attrs = { rev = "abc" } },
            prelude = "//tools/prelude.lua",
            repos = { vendor = "third_party/vendor" },
            extends = "configs/more.lua",
          }
        "#,
      )
      .unwrap();

      assert_eq!(config.resolver.as_ref().unwrap().script, "tools/resolver.lua");
      assert_eq!(
        config.resolver.unwrap().attrs.get("rev"),
        Some(&Value::String("abc".to_string()))
      );
      assert_eq!(config.prelude.as_deref(), Some("//tools/prelude.lua"));
      assert_eq!(config.repos.get("vendor").map(String::as_str), Some("third_party/vendor"));
      assert_eq!(config.extends.as_deref(), Some("configs/more.lua"));
    }

    #[test]
    fn unknown_fields_are_errors() {
      let err = parse_config("workspace.lua", "return { resolvers = {} }").unwrap_err();
      assert!(err.to_string().contains("unknown workspace configuration field"));
    }

    #[test]
    fn resolver_without_script_is_an_error() {
      let err = parse_config("workspace.lua", "return { resolver = { attrs = {} } }").unwrap_err();
      assert!(err.to_string().contains("'script'"));
    }
  }

  mod chain {
    use super::*;

    #[test]
    fn missing_workspace_file_is_empty_config() {
      let root = Root::new("/ws");
      let mut env = StaticEnv::default();
      env.insert(
        file_state_key(&root, WORKSPACE_FILE_NAME),
        Ok(GraphValue::FileState(FileState::Nonexistent)),
      );

      let outcome = workspace_config_fn(&root, 0, &mut env).unwrap();
      let Outcome::Ready(GraphValue::WorkspaceConfig(config)) = outcome else {
        panic!("expected a ready config");
      };
      assert_eq!(*config, WorkspaceConfig::default());
    }

    #[test]
    fn chain_walk_suspends_on_missing_links() {
      let mut env = StaticEnv::default();
      // Link 0 not memoized yet: the walk must suspend, not guess.
      let outcome = resolved(&mut env).unwrap();
      assert!(outcome.is_pending());
      assert!(env.values_missing());
    }

    #[test]
    fn later_links_override_earlier_ones() {
      let mut env = StaticEnv::default();
      env.insert(
        GraphKey::WorkspaceConfig(0),
        Ok(GraphValue::WorkspaceConfig(Arc::new(WorkspaceConfig {
          resolver: Some(ResolverDecl {
            script: "old.lua".to_string(),
            attrs: BTreeMap::new(),
          }),
          prelude: Some("//old.lua".to_string()),
          repos: BTreeMap::from([("a".to_string(), "vendor/a".to_string())]),
          extends: Some("more.lua".to_string()),
        }))),
      );
      env.insert(
        GraphKey::WorkspaceConfig(1),
        Ok(GraphValue::WorkspaceConfig(Arc::new(WorkspaceConfig {
          resolver: Some(ResolverDecl {
            script: "new.lua".to_string(),
            attrs: BTreeMap::new(),
          }),
          prelude: None,
          repos: BTreeMap::from([("b".to_string(), "vendor/b".to_string())]),
          extends: None,
        }))),
      );

      let Outcome::Ready(merged) = resolved(&mut env).unwrap() else {
        panic!("expected ready");
      };
      assert_eq!(merged.resolver.as_ref().unwrap().script, "new.lua");
      assert_eq!(merged.prelude.as_deref(), Some("//old.lua"));
      assert_eq!(merged.repos.len(), 2);
    }
  }
}
