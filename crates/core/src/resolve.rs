//! Virtual-file resolution node functions.
//!
//! Whether a path "exists" can be answered two ways: by the local disk, or
//! by a user-supplied resolver declared in the workspace configuration.
//! The resolver is best-effort by design: any failure inside it degrades
//! to "not found" (with a log line) rather than failing unrelated package
//! loads, which deliberately makes resolver bugs indistinguishable from
//! absent files to callers.

use std::sync::Arc;

use loadstone_lua::resolver::{ResolverOutcome, ResolverRequest, run_resolver};
use tracing::{debug, warn};

use crate::error::{LoadError, LoadErrorKind, Transience};
use crate::graph::{GraphEnv, GraphKey, GraphValue, ModuleSource, Outcome};
use crate::hash::digest_bytes;
use crate::vfs::{ContentProxy, FileState, Root, RootedPath};
use crate::workspace;

/// Node function for plain filesystem state.
pub fn file_state_fn(path: &RootedPath) -> Result<Outcome<GraphValue>, LoadError> {
  let state = crate::vfs::probe(&path.as_path())
    .map_err(|err| LoadError::from_io(&err, &format!("stat of '{}'", path.rel)))?;
  Ok(Outcome::Ready(GraphValue::FileState(state)))
}

enum ResolverAnswer {
  Pending,
  NoResolver,
  Answered(ResolverOutcome),
}

/// Walk the configuration chain, find the active resolver (if any) and
/// invoke it for one path. Runs only during the loading phase, in a
/// runtime with none of the analysis-time symbols.
fn invoke_resolver(
  workspace_root: &Root,
  path: &RootedPath,
  env: &mut dyn GraphEnv,
) -> Result<ResolverAnswer, LoadError> {
  let config = match workspace::resolved(env)? {
    Outcome::Pending => return Ok(ResolverAnswer::Pending),
    Outcome::Ready(config) => config,
  };
  let Some(decl) = &config.resolver else {
    return Ok(ResolverAnswer::NoResolver);
  };

  let script_path = workspace_root.join(&decl.script);
  let script = match std::fs::read_to_string(&script_path) {
    Ok(script) => script,
    Err(err) => {
      warn!(
        script = decl.script.as_str(),
        error = %err,
        "resolver script unreadable; treating path as missing"
      );
      return Ok(ResolverAnswer::Answered(ResolverOutcome::Missing));
    }
  };

  let request = ResolverRequest {
    workspace_root: workspace_root.path(),
    attrs: &decl.attrs,
    path: &path.rel,
  };
  match run_resolver(&script, &decl.script, &request) {
    Ok(outcome) => {
      debug!(path = path.rel.as_str(), "resolver answered");
      Ok(ResolverAnswer::Answered(outcome))
    }
    Err(err) => {
      // Deliberate: resolver failures read as absence.
      warn!(path = path.rel.as_str(), error = %err, "resolver failed; treating path as missing");
      Ok(ResolverAnswer::Answered(ResolverOutcome::Missing))
    }
  }
}

/// Node function for resolver-mediated file state.
pub fn virtual_file_state_fn(
  workspace_root: &Root,
  path: &RootedPath,
  env: &mut dyn GraphEnv,
) -> Result<Outcome<GraphValue>, LoadError> {
  let state = match invoke_resolver(workspace_root, path, env)? {
    ResolverAnswer::Pending => return Ok(Outcome::Pending),
    ResolverAnswer::NoResolver => {
      // No resolver configured: a direct existence probe decides.
      crate::vfs::probe(&path.as_path())
        .map_err(|err| LoadError::from_io(&err, &format!("stat of '{}'", path.rel)))?
    }
    ResolverAnswer::Answered(ResolverOutcome::Missing) => FileState::Nonexistent,
    ResolverAnswer::Answered(ResolverOutcome::Exists) => {
      // No content to fingerprint; identity derives from the path.
      FileState::Special(ContentProxy::Synthetic(digest_bytes(path.rel.as_bytes())))
    }
    ResolverAnswer::Answered(ResolverOutcome::Content(bytes)) => {
      FileState::Special(ContentProxy::Synthetic(digest_bytes(&bytes)))
    }
  };
  Ok(Outcome::Ready(GraphValue::FileState(state)))
}

/// Node function for resolver-produced file contents.
pub fn virtual_file_content_fn(
  workspace_root: &Root,
  path: &RootedPath,
  env: &mut dyn GraphEnv,
) -> Result<Outcome<GraphValue>, LoadError> {
  match invoke_resolver(workspace_root, path, env)? {
    ResolverAnswer::Pending => Ok(Outcome::Pending),
    ResolverAnswer::NoResolver => Err(LoadError::new(
      LoadErrorKind::InconsistentFilesystem(format!(
        "'{}' was resolved virtually but no resolver is configured anymore",
        path.rel
      )),
      Transience::Transient,
    )),
    ResolverAnswer::Answered(ResolverOutcome::Content(bytes)) => {
      Ok(Outcome::Ready(GraphValue::FileContent(Arc::new(bytes))))
    }
    ResolverAnswer::Answered(ResolverOutcome::Missing) => Err(LoadError::new(
      LoadErrorKind::InconsistentFilesystem(format!(
        "virtual file '{}' vanished between its existence probe and the content fetch",
        path.rel
      )),
      Transience::Transient,
    )),
    ResolverAnswer::Answered(ResolverOutcome::Exists) => Err(LoadError::persistent(
      LoadErrorKind::BuildFileContainsErrors(format!(
        "the resolver acknowledged '{}' but produced no contents for it",
        path.rel
      )),
    )),
  }
}

/// Node function for a module file's raw source, virtual-aware.
pub fn module_source_fn(path: &RootedPath, env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError> {
  let state = match env.lookup(&GraphKey::FileState(path.clone()))? {
    Outcome::Pending => return Ok(Outcome::Pending),
    Outcome::Ready(value) => value,
  };
  if state.as_file_state().map(|s| s.exists()).unwrap_or(false) {
    let bytes = std::fs::read(path.as_path())
      .map_err(|err| LoadError::from_io(&err, &format!("reading module '{}'", path.rel)))?;
    return Ok(Outcome::Ready(GraphValue::ModuleSource(Arc::new(ModuleSource {
      path: path.clone(),
      bytes,
    }))));
  }

  // Fall back to the resolver, the same way package lookup does.
  let virtual_state = match env.lookup(&GraphKey::VirtualFileState(path.clone()))? {
    Outcome::Pending => return Ok(Outcome::Pending),
    Outcome::Ready(value) => value,
  };
  if virtual_state.as_file_state().map(|s| s.exists()).unwrap_or(false) {
    let content = match env.lookup(&GraphKey::VirtualFileContent(path.clone()))? {
      Outcome::Pending => return Ok(Outcome::Pending),
      Outcome::Ready(value) => value,
    };
    if let Some(bytes) = content.as_file_content() {
      return Ok(Outcome::Ready(GraphValue::ModuleSource(Arc::new(ModuleSource {
        path: path.clone(),
        bytes: bytes.as_ref().clone(),
      }))));
    }
  }

  Err(LoadError::persistent(LoadErrorKind::ModuleNotFound(format!(
    "module file '{}' does not exist",
    path.rel
  ))))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::StaticEnv;
  use crate::workspace::{ResolverDecl, WorkspaceConfig};
  use loadstone_lua::value::Value;
  use std::collections::BTreeMap;
  use std::fs;
  use tempfile::TempDir;

  fn seed_config(env: &mut StaticEnv, config: WorkspaceConfig) {
    env.insert(
      GraphKey::WorkspaceConfig(0),
      Ok(GraphValue::WorkspaceConfig(Arc::new(config))),
    );
  }

  fn resolver_config(script: &str, attrs: BTreeMap<String, Value>) -> WorkspaceConfig {
    WorkspaceConfig {
      resolver: Some(ResolverDecl {
        script: script.to_string(),
        attrs,
      }),
      ..WorkspaceConfig::default()
    }
  }

  fn expect_state(outcome: Outcome<GraphValue>) -> FileState {
    match outcome {
      Outcome::Ready(GraphValue::FileState(state)) => state,
      other => panic!("expected a file state, got {:?}", other),
    }
  }

  #[test]
  fn no_resolver_falls_back_to_disk_probe() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("real.lua"), "x").unwrap();
    let root = Root::new(dir.path());
    let mut env = StaticEnv::default();
    seed_config(&mut env, WorkspaceConfig::default());

    let present = expect_state(
      virtual_file_state_fn(&root, &RootedPath::new(root.clone(), "real.lua"), &mut env).unwrap(),
    );
    assert!(present.exists());

    let absent = expect_state(
      virtual_file_state_fn(&root, &RootedPath::new(root.clone(), "ghost.lua"), &mut env).unwrap(),
    );
    assert_eq!(absent, FileState::Nonexistent);
  }

  #[test]
  fn configured_resolver_answers_probes() {
    let dir = TempDir::new().unwrap();
    fs::write(
      dir.path().join("resolver.lua"),
      r#"
        return function(ctx, path)
          return path == "pkg/PKG.lua"
        end
      "#,
    )
    .unwrap();
    let root = Root::new(dir.path());
    let mut env = StaticEnv::default();
    seed_config(&mut env, resolver_config("resolver.lua", BTreeMap::new()));

    let hit = expect_state(
      virtual_file_state_fn(&root, &RootedPath::new(root.clone(), "pkg/PKG.lua"), &mut env).unwrap(),
    );
    assert!(matches!(hit, FileState::Special(ContentProxy::Synthetic(_))));

    let miss = expect_state(
      virtual_file_state_fn(&root, &RootedPath::new(root.clone(), "other/PKG.lua"), &mut env).unwrap(),
    );
    assert_eq!(miss, FileState::Nonexistent);
  }

  #[test]
  fn resolver_failure_reads_as_absence() {
    let dir = TempDir::new().unwrap();
    fs::write(
      dir.path().join("resolver.lua"),
      "return function(ctx, path) error('resolver bug') end",
    )
    .unwrap();
    let root = Root::new(dir.path());
    let mut env = StaticEnv::default();
    seed_config(&mut env, resolver_config("resolver.lua", BTreeMap::new()));

    let state = expect_state(
      virtual_file_state_fn(&root, &RootedPath::new(root.clone(), "pkg/PKG.lua"), &mut env).unwrap(),
    );
    assert_eq!(state, FileState::Nonexistent);
  }

  #[test]
  fn content_fetch_returns_resolver_bytes() {
    let dir = TempDir::new().unwrap();
    fs::write(
      dir.path().join("resolver.lua"),
      r#"return function(ctx, path) return "target { name = 'x', kind = 'gen' }" end"#,
    )
    .unwrap();
    let root = Root::new(dir.path());
    let mut env = StaticEnv::default();
    seed_config(&mut env, resolver_config("resolver.lua", BTreeMap::new()));

    let outcome =
      virtual_file_content_fn(&root, &RootedPath::new(root.clone(), "pkg/PKG.lua"), &mut env).unwrap();
    let Outcome::Ready(GraphValue::FileContent(bytes)) = outcome else {
      panic!("expected contents");
    };
    assert!(String::from_utf8(bytes.as_ref().clone()).unwrap().contains("kind = 'gen'"));
  }

  #[test]
  fn content_fetch_of_vanished_file_is_transient_inconsistency() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("resolver.lua"), "return function(ctx, path) return nil end").unwrap();
    let root = Root::new(dir.path());
    let mut env = StaticEnv::default();
    seed_config(&mut env, resolver_config("resolver.lua", BTreeMap::new()));

    let err =
      virtual_file_content_fn(&root, &RootedPath::new(root.clone(), "pkg/PKG.lua"), &mut env).unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err.kind, LoadErrorKind::InconsistentFilesystem(_)));
  }

  #[test]
  fn chain_walk_suspends_until_config_available() {
    let root = Root::new("/ws");
    let mut env = StaticEnv::default();
    let outcome =
      virtual_file_state_fn(&root, &RootedPath::new(root.clone(), "pkg/PKG.lua"), &mut env).unwrap();
    assert!(outcome.is_pending());
  }

  #[test]
  fn module_source_prefers_real_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("defs.lua"), "return {}").unwrap();
    let root = Root::new(dir.path());
    let rooted = RootedPath::new(root.clone(), "defs.lua");

    let mut env = StaticEnv::default();
    env.insert(
      GraphKey::FileState(rooted.clone()),
      Ok(GraphValue::FileState(FileState::Regular { size: 9, mtime: 0 })),
    );

    let outcome = module_source_fn(&rooted, &mut env).unwrap();
    let Outcome::Ready(GraphValue::ModuleSource(module)) = outcome else {
      panic!("expected module source");
    };
    assert_eq!(module.bytes, b"return {}");
  }

  #[test]
  fn missing_module_is_a_persistent_error() {
    let root = Root::new("/ws");
    let rooted = RootedPath::new(root.clone(), "defs.lua");
    let mut env = StaticEnv::default();
    env.insert(
      GraphKey::FileState(rooted.clone()),
      Ok(GraphValue::FileState(FileState::Nonexistent)),
    );
    env.insert(
      GraphKey::VirtualFileState(rooted.clone()),
      Ok(GraphValue::FileState(FileState::Nonexistent)),
    );

    let err = module_source_fn(&rooted, &mut env).unwrap_err();
    assert!(!err.is_transient());
    assert!(matches!(err.kind, LoadErrorKind::ModuleNotFound(_)));
  }
}
