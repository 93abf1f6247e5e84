//! The demand-driven graph substrate boundary.
//!
//! Package construction is written against [`GraphEnv`]: a node asks for
//! dependency values, and when one is not available yet it returns
//! [`Outcome::Pending`] instead of blocking. The engine re-invokes the
//! node from the top once the missing values exist, which is why anything
//! expensive a node computes before suspending must live in its
//! [`ComputeState`] scratch.

pub mod engine;

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::LoadError;
use crate::events::Reporter;
use crate::globber::GlobDescriptor;
use crate::id::PackageId;
use crate::lookup::PackageLookup;
use crate::package::Package;
use crate::vfs::{FileState, RootedPath};
use crate::workspace::WorkspaceConfig;

/// The explicit suspend signal: either the value, or "dependencies are
/// missing, re-invoke me later".
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
  Pending,
  Ready(T),
}

impl<T> Outcome<T> {
  pub fn is_pending(&self) -> bool {
    matches!(self, Outcome::Pending)
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
    match self {
      Outcome::Pending => Outcome::Pending,
      Outcome::Ready(value) => Outcome::Ready(f(value)),
    }
  }
}

/// The source of a module referenced from a description file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
  pub path: RootedPath,
  pub bytes: Vec<u8>,
}

/// Every kind of node this crate computes or consumes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphKey {
  /// The fully built package.
  Package(PackageId),
  /// Where (and whether) a package's description file lives.
  PackageLookup(PackageId),
  /// The nearest enclosing package of a directory.
  ContainingPackage(PackageId),
  /// Plain filesystem state of a path.
  FileState(RootedPath),
  /// Resolver-mediated state of a path.
  VirtualFileState(RootedPath),
  /// Resolver-produced contents of a path.
  VirtualFileContent(RootedPath),
  /// One glob pattern's match set.
  Glob(GlobDescriptor),
  /// The raw source of a module file.
  ModuleSource(RootedPath),
  /// One link of the workspace configuration chain.
  WorkspaceConfig(u32),
}

/// The value produced for each [`GraphKey`] kind. Payloads are cheap to
/// clone so memoized values can be shared freely.
#[derive(Debug, Clone)]
pub enum GraphValue {
  Package(Arc<Package>),
  PackageLookup(Arc<PackageLookup>),
  ContainingPackage(Option<PackageId>),
  FileState(FileState),
  FileContent(Arc<Vec<u8>>),
  Glob(Arc<BTreeSet<String>>),
  ModuleSource(Arc<ModuleSource>),
  WorkspaceConfig(Arc<WorkspaceConfig>),
}

impl GraphValue {
  pub fn as_package(&self) -> Option<&Arc<Package>> {
    match self {
      GraphValue::Package(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_package_lookup(&self) -> Option<&Arc<PackageLookup>> {
    match self {
      GraphValue::PackageLookup(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_containing_package(&self) -> Option<&Option<PackageId>> {
    match self {
      GraphValue::ContainingPackage(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_file_state(&self) -> Option<&FileState> {
    match self {
      GraphValue::FileState(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_file_content(&self) -> Option<&Arc<Vec<u8>>> {
    match self {
      GraphValue::FileContent(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_glob(&self) -> Option<&Arc<BTreeSet<String>>> {
    match self {
      GraphValue::Glob(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_module_source(&self) -> Option<&Arc<ModuleSource>> {
    match self {
      GraphValue::ModuleSource(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_workspace_config(&self) -> Option<&Arc<WorkspaceConfig>> {
    match self {
      GraphValue::WorkspaceConfig(value) => Some(value),
      _ => None,
    }
  }
}

/// Result of a batched lookup: values (or per-key errors) for everything
/// already available, plus the set of keys that were missing.
#[derive(Debug, Default)]
pub struct BatchResult {
  pub entries: BTreeMap<GraphKey, Result<GraphValue, LoadError>>,
  pub missing: BTreeSet<GraphKey>,
}

/// Per-request scratch that survives restarts of one construction and is
/// torn down when the construction commits (success or failure).
#[derive(Default)]
pub struct ComputeState {
  slots: HashMap<TypeId, Box<dyn Any>>,
}

impl ComputeState {
  pub fn get_or_default<T: Default + 'static>(&mut self) -> &mut T {
    self
      .slots
      .entry(TypeId::of::<T>())
      .or_insert_with(|| Box::<T>::default())
      .downcast_mut::<T>()
      .expect("compute state slot holds its keyed type")
  }
}

/// The evaluation environment handed to a node function.
///
/// Every lookup is recorded as a formal dependency of the requesting node,
/// whether or not it produced a value, so future incremental re-evaluation
/// has correct invalidation edges.
pub trait GraphEnv {
  fn lookup(&mut self, key: &GraphKey) -> Result<Outcome<GraphValue>, LoadError>;

  /// Request many keys in one batch. Missing keys are recorded and flagged;
  /// present keys come back with their value or their error.
  fn batch_lookup(&mut self, keys: &[GraphKey]) -> BatchResult;

  /// Whether any lookup so far in this invocation found a key missing.
  fn values_missing(&self) -> bool;

  /// The construction's restart-surviving scratch.
  fn state(&mut self) -> &mut ComputeState;

  fn reporter(&mut self) -> &mut dyn Reporter;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn outcome_map_preserves_pending() {
    let pending: Outcome<u32> = Outcome::Pending;
    assert!(pending.map(|v| v + 1).is_pending());
    assert_eq!(Outcome::Ready(1).map(|v| v + 1), Outcome::Ready(2));
  }

  #[test]
  fn compute_state_slots_are_typed() {
    #[derive(Default)]
    struct Counter(u32);

    let mut state = ComputeState::default();
    state.get_or_default::<Counter>().0 += 1;
    state.get_or_default::<Counter>().0 += 1;
    assert_eq!(state.get_or_default::<Counter>().0, 2);
  }
}
