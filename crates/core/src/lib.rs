//! loadstone-core: the incremental package-loading core
//!
//! Given a package identifier, this crate locates, (possibly virtually)
//! materializes, compiles and executes a `PKG.lua` description file into
//! an immutable package of targets, as one memoized, restart-tolerant
//! node of a demand-driven dependency graph:
//! - `loader`: the construction state machine
//! - `globber`: graph-first glob evaluation with a synchronous fallback
//! - `compile`: the compiled-but-unexecuted form of a description file
//! - `resolve`: virtual-file resolution through a user-supplied resolver
//! - `graph`: the substrate boundary plus an in-process memoizing engine

pub mod compile;
pub mod consts;
pub mod error;
pub mod events;
pub mod globber;
pub mod graph;
pub mod hash;
pub mod id;
pub mod loader;
pub mod lookup;
pub mod package;
pub mod resolve;
pub mod vfs;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testutil;

pub use compile::{CompiledPkgFile, compile_pkg_file};
pub use error::{LoadError, LoadErrorKind, Transience};
pub use events::{CollectingReporter, Event, Postable, Reporter, Severity};
pub use globber::{GlobFailure, GlobOperation, HybridGlobber};
pub use graph::engine::{GraphFns, MemoEngine};
pub use graph::{GraphEnv, GraphKey, GraphValue, Outcome};
pub use id::{Label, PackageId, PkgPath, RepoName};
pub use loader::Loader;
pub use package::{Package, PackageBuilder, Target};
pub use vfs::{FileState, Root, RootedPath};

/// Result type for package-loading operations
pub type Result<T> = std::result::Result<T, LoadError>;
