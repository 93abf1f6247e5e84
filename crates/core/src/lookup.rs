//! Package lookup and containing-package lookup node functions.

use std::sync::Arc;

use crate::consts::PKG_FILE_NAME;
use crate::error::LoadError;
use crate::graph::{GraphEnv, GraphKey, GraphValue, Outcome};
use crate::id::{PackageId, RepoName, validate_package_path};
use crate::vfs::{Root, RootedPath};
use crate::workspace;

/// Where (and whether) a package's description file lives. The non-exists
/// variants carry distinct, remediation-oriented messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageLookup {
  Exists {
    root: Root,
    build_file: RootedPath,
    /// Whether the description file only exists through the resolver.
    is_virtual: bool,
  },
  NoBuildFile { message: String },
  NoRepository { message: String },
  InvalidName { message: String },
}

impl PackageLookup {
  pub fn package_exists(&self) -> bool {
    matches!(self, PackageLookup::Exists { .. })
  }
}

/// Resolution of a repository name to its root directory.
pub(crate) enum RepoRoot {
  Pending,
  Found(Root),
  Missing(String),
}

/// Resolve a repository root; external repositories come from the
/// workspace configuration chain.
pub(crate) fn repo_root(
  workspace_root: &Root,
  repo: &RepoName,
  env: &mut dyn GraphEnv,
) -> Result<RepoRoot, LoadError> {
  if repo.is_main() {
    return Ok(RepoRoot::Found(workspace_root.clone()));
  }
  let config = match workspace::resolved(env)? {
    Outcome::Pending => return Ok(RepoRoot::Pending),
    Outcome::Ready(config) => config,
  };
  match config.repos.get(repo.as_str()) {
    Some(rel) => Ok(RepoRoot::Found(Root::new(workspace_root.join(rel)))),
    None => Ok(RepoRoot::Missing(format!(
      "repository '{}' is not declared in the workspace configuration; \
       add it to the 'repos' table in workspace.lua",
      repo
    ))),
  }
}

fn build_file_rel(id: &PackageId) -> String {
  if id.path().is_root() {
    PKG_FILE_NAME.to_string()
  } else {
    format!("{}/{}", id.path(), PKG_FILE_NAME)
  }
}

/// Node function answering where a package's description file is.
pub fn package_lookup_fn(
  workspace_root: &Root,
  id: &PackageId,
  env: &mut dyn GraphEnv,
) -> Result<Outcome<GraphValue>, LoadError> {
  if let Err(message) = validate_package_path(id.path().as_str()) {
    return ready(PackageLookup::InvalidName { message });
  }

  let root = match repo_root(workspace_root, id.repo(), env)? {
    RepoRoot::Pending => return Ok(Outcome::Pending),
    RepoRoot::Found(root) => root,
    RepoRoot::Missing(message) => return ready(PackageLookup::NoRepository { message }),
  };

  let build_file = RootedPath::new(root.clone(), build_file_rel(id));
  let state = match env.lookup(&GraphKey::FileState(build_file.clone()))? {
    Outcome::Pending => return Ok(Outcome::Pending),
    Outcome::Ready(value) => value,
  };
  if state.as_file_state().map(|s| s.exists()).unwrap_or(false) {
    return ready(PackageLookup::Exists {
      root,
      build_file,
      is_virtual: false,
    });
  }

  if id.maybe_virtual() {
    let virtual_state = match env.lookup(&GraphKey::VirtualFileState(build_file.clone()))? {
      Outcome::Pending => return Ok(Outcome::Pending),
      Outcome::Ready(value) => value,
    };
    if virtual_state.as_file_state().map(|s| s.exists()).unwrap_or(false) {
      return ready(PackageLookup::Exists {
        root,
        build_file,
        is_virtual: true,
      });
    }
  }

  let where_ = if id.path().is_root() {
    "the workspace root".to_string()
  } else {
    format!("directory '{}'", id.path())
  };
  ready(PackageLookup::NoBuildFile {
    message: format!(
      "no {} file found in {}; to create a package here, add a {} file",
      PKG_FILE_NAME, where_, PKG_FILE_NAME
    ),
  })
}

fn ready(lookup: PackageLookup) -> Result<Outcome<GraphValue>, LoadError> {
  Ok(Outcome::Ready(GraphValue::PackageLookup(Arc::new(lookup))))
}

/// Node function answering which package contains a directory: the nearest
/// ancestor-or-self directory carrying a description file, if any.
pub fn containing_package_fn(
  workspace_root: &Root,
  id: &PackageId,
  env: &mut dyn GraphEnv,
) -> Result<Outcome<GraphValue>, LoadError> {
  let root = match repo_root(workspace_root, id.repo(), env)? {
    RepoRoot::Pending => return Ok(Outcome::Pending),
    RepoRoot::Found(root) => root,
    // A directory in an unknown repository is contained by nothing.
    RepoRoot::Missing(_) => return Ok(Outcome::Ready(GraphValue::ContainingPackage(None))),
  };

  let candidates = id.path().self_and_ancestors();
  let keys: Vec<GraphKey> = candidates
    .iter()
    .map(|dir| {
      let rel = if dir.is_root() {
        PKG_FILE_NAME.to_string()
      } else {
        format!("{}/{}", dir, PKG_FILE_NAME)
      };
      GraphKey::FileState(RootedPath::new(root.clone(), rel))
    })
    .collect();

  let batch = env.batch_lookup(&keys);
  if !batch.missing.is_empty() {
    return Ok(Outcome::Pending);
  }

  for (dir, key) in candidates.iter().zip(&keys) {
    let state = match batch.entries.get(key) {
      Some(Ok(value)) => value.clone(),
      Some(Err(error)) => return Err(error.clone()),
      None => continue,
    };
    if state.as_file_state().map(|s| s.exists()).unwrap_or(false) {
      let containing = PackageId::new(id.repo().clone(), dir.clone(), false);
      return Ok(Outcome::Ready(GraphValue::ContainingPackage(Some(containing))));
    }
  }
  Ok(Outcome::Ready(GraphValue::ContainingPackage(None)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hash::digest_bytes;
  use crate::id::PkgPath;
  use crate::testutil::StaticEnv;
  use crate::vfs::{ContentProxy, FileState};

  fn root() -> Root {
    Root::new("/ws")
  }

  fn file_key(rel: &str) -> GraphKey {
    GraphKey::FileState(RootedPath::new(root(), rel))
  }

  fn regular() -> GraphValue {
    GraphValue::FileState(FileState::Regular { size: 1, mtime: 0 })
  }

  fn missing() -> GraphValue {
    GraphValue::FileState(FileState::Nonexistent)
  }

  fn expect_lookup(outcome: Outcome<GraphValue>) -> Arc<PackageLookup> {
    match outcome {
      Outcome::Ready(GraphValue::PackageLookup(lookup)) => lookup,
      other => panic!("expected a package lookup, got {:?}", other),
    }
  }

  #[test]
  fn existing_build_file_resolves() {
    let mut env = StaticEnv::default();
    env.insert(file_key("a/b/PKG.lua"), Ok(regular()));
    let id = PackageId::in_main(PkgPath::new("a/b").unwrap());

    let lookup = expect_lookup(package_lookup_fn(&root(), &id, &mut env).unwrap());
    match &*lookup {
      PackageLookup::Exists { build_file, is_virtual, .. } => {
        assert_eq!(build_file.rel, "a/b/PKG.lua");
        assert!(!is_virtual);
      }
      other => panic!("expected Exists, got {:?}", other),
    }
  }

  #[test]
  fn missing_build_file_has_remediation_message() {
    let mut env = StaticEnv::default();
    env.insert(file_key("a/PKG.lua"), Ok(missing()));
    let id = PackageId::in_main(PkgPath::new("a").unwrap());

    let lookup = expect_lookup(package_lookup_fn(&root(), &id, &mut env).unwrap());
    match &*lookup {
      PackageLookup::NoBuildFile { message } => {
        assert!(message.contains("no PKG.lua file found in directory 'a'"));
        assert!(message.contains("add a PKG.lua file"));
      }
      other => panic!("expected NoBuildFile, got {:?}", other),
    }
  }

  #[test]
  fn virtual_fallback_only_for_maybe_virtual_identifiers() {
    let mut env = StaticEnv::default();
    env.insert(file_key("a/PKG.lua"), Ok(missing()));
    env.insert(
      GraphKey::VirtualFileState(RootedPath::new(root(), "a/PKG.lua")),
      Ok(GraphValue::FileState(FileState::Special(ContentProxy::Synthetic(
        digest_bytes(b"virtual"),
      )))),
    );

    let plain = PackageId::in_main(PkgPath::new("a").unwrap());
    let lookup = expect_lookup(package_lookup_fn(&root(), &plain, &mut env).unwrap());
    assert!(!lookup.package_exists());

    let maybe_virtual = plain.with_maybe_virtual(true);
    let lookup = expect_lookup(package_lookup_fn(&root(), &maybe_virtual, &mut env).unwrap());
    match &*lookup {
      PackageLookup::Exists { is_virtual, .. } => assert!(is_virtual),
      other => panic!("expected a virtual Exists, got {:?}", other),
    }
  }

  #[test]
  fn unknown_repository_is_its_own_reason() {
    let mut env = StaticEnv::default();
    env.insert(
      GraphKey::WorkspaceConfig(0),
      Ok(GraphValue::WorkspaceConfig(Arc::new(crate::workspace::WorkspaceConfig::default()))),
    );
    let id = PackageId::new(RepoName::new("vendor").unwrap(), PkgPath::new("x").unwrap(), false);

    let lookup = expect_lookup(package_lookup_fn(&root(), &id, &mut env).unwrap());
    match &*lookup {
      PackageLookup::NoRepository { message } => {
        assert!(message.contains("'@vendor'"));
        assert!(message.contains("workspace.lua"));
      }
      other => panic!("expected NoRepository, got {:?}", other),
    }
  }

  #[test]
  fn containing_package_finds_nearest_ancestor() {
    let mut env = StaticEnv::default();
    env.insert(file_key("a/b/c/PKG.lua"), Ok(missing()));
    env.insert(file_key("a/b/PKG.lua"), Ok(regular()));
    env.insert(file_key("a/PKG.lua"), Ok(regular()));
    env.insert(file_key("PKG.lua"), Ok(missing()));

    let dir = PackageId::in_main(PkgPath::new("a/b/c").unwrap());
    let outcome = containing_package_fn(&root(), &dir, &mut env).unwrap();
    let Outcome::Ready(GraphValue::ContainingPackage(Some(containing))) = outcome else {
      panic!("expected a containing package");
    };
    assert_eq!(containing.path().as_str(), "a/b");
  }

  #[test]
  fn containing_package_suspends_on_missing_states() {
    let mut env = StaticEnv::default();
    let dir = PackageId::in_main(PkgPath::new("a").unwrap());
    let outcome = containing_package_fn(&root(), &dir, &mut env).unwrap();
    assert!(outcome.is_pending());
    // Both the directory itself and the root were requested in one batch.
    assert_eq!(env.missing_requested().len(), 2);
  }
}
