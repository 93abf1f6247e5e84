//! The closed error taxonomy for package loading.
//!
//! One enum carries every failure reason; transience rides along so the
//! graph can decide whether a failed node is worth retrying on a later
//! build. Missing dependencies are not errors — they are the `Pending`
//! half of [`crate::graph::Outcome`].

use thiserror::Error;

use crate::id::PackageId;

/// Whether a failure may resolve itself on a later build without any input
/// changing (a racing filesystem, a flaky read), or is stable until
/// something changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
  Transient,
  Persistent,
}

/// Every way a graph node in this crate can fail.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadErrorKind {
  /// The package directory exists but carries no description file.
  #[error("{0}")]
  NoBuildFile(String),

  /// The identifier names a repository the workspace does not declare.
  #[error("{0}")]
  RepositoryNotFound(String),

  /// The package path itself is malformed.
  #[error("{0}")]
  InvalidPackageName(String),

  /// The description file (or one of its modules) failed to load.
  #[error("error loading package: {0}")]
  BuildFileContainsErrors(String),

  /// A referenced module file does not exist.
  #[error("{0}")]
  ModuleNotFound(String),

  /// A catch-all for "this package cannot be produced".
  #[error("no such package: {0}")]
  NoSuchPackage(String),

  /// The filesystem contradicted an observation made earlier in the same
  /// build.
  #[error("inconsistent filesystem: {0}")]
  InconsistentFilesystem(String),

  /// A symlink cycle was hit while globbing.
  #[error("symlink issue while evaluating globs: {0}")]
  SymlinkCycle(String),

  /// A malformed glob pattern or an empty result where one was required.
  #[error("bad glob: {0}")]
  BadGlob(String),

  #[error("io error: {0}")]
  Io(String),
}

/// A failure, attributed to the package whose construction surfaced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadError {
  pub package: Option<PackageId>,
  pub kind: LoadErrorKind,
  pub transience: Transience,
}

impl std::fmt::Display for LoadError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(package) = &self.package {
      write!(f, "package {}: ", package)?;
    }
    write!(f, "{}", self.kind)
  }
}

impl std::error::Error for LoadError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.kind)
  }
}

impl LoadError {
  pub fn new(kind: LoadErrorKind, transience: Transience) -> Self {
    Self {
      package: None,
      kind,
      transience,
    }
  }

  pub fn persistent(kind: LoadErrorKind) -> Self {
    Self::new(kind, Transience::Persistent)
  }

  pub fn transient(kind: LoadErrorKind) -> Self {
    Self::new(kind, Transience::Transient)
  }

  /// Attach the requesting package, preserving an earlier attribution.
  pub fn for_package(mut self, package: &PackageId) -> Self {
    if self.package.is_none() {
      self.package = Some(package.clone());
    }
    self
  }

  pub fn is_transient(&self) -> bool {
    self.transience == Transience::Transient
  }

  pub fn from_io(err: &std::io::Error, context: &str) -> Self {
    // Reads are retried on the next build; whatever raced us may be gone.
    Self::transient(LoadErrorKind::Io(format!("{}: {}", context, err)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::id::PkgPath;

  #[test]
  fn display_includes_package_attribution() {
    let pkg = PackageId::in_main(PkgPath::new("a/b").unwrap());
    let err =
      LoadError::persistent(LoadErrorKind::NoBuildFile("no PKG.lua in 'a/b'".to_string())).for_package(&pkg);
    assert_eq!(err.to_string(), "package //a/b: no PKG.lua in 'a/b'");
  }

  #[test]
  fn first_attribution_wins() {
    let inner = PackageId::in_main(PkgPath::new("inner").unwrap());
    let outer = PackageId::in_main(PkgPath::new("outer").unwrap());
    let err = LoadError::persistent(LoadErrorKind::Io("boom".to_string()))
      .for_package(&inner)
      .for_package(&outer);
    assert_eq!(err.package, Some(inner));
  }

  #[test]
  fn io_errors_are_transient() {
    let io = std::io::Error::other("flake");
    assert!(LoadError::from_io(&io, "reading PKG.lua").is_transient());
  }
}
