//! Rooted paths and file states.
//!
//! A [`FileState`] carries just enough identity for the graph to notice
//! change between evaluations: size and mtime for real files, a content
//! digest for files synthesized by a resolver.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::hash::ContentDigest;

/// A filesystem root (a workspace or repository directory).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Root(Arc<PathBuf>);

impl Root {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self(Arc::new(path.into()))
  }

  pub fn path(&self) -> &Path {
    &self.0
  }

  pub fn join(&self, rel: &str) -> PathBuf {
    self.0.join(rel)
  }
}

impl fmt::Display for Root {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.display())
  }
}

/// A root plus a `/`-separated root-relative path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootedPath {
  pub root: Root,
  pub rel: String,
}

impl RootedPath {
  pub fn new(root: Root, rel: impl Into<String>) -> Self {
    Self {
      root,
      rel: rel.into(),
    }
  }

  pub fn as_path(&self) -> PathBuf {
    self.root.join(&self.rel)
  }
}

impl fmt::Display for RootedPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.root, self.rel)
  }
}

/// Change identity for a special (synthesized) file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentProxy {
  /// Stat-derived identity.
  Stat { size: u64, mtime: i64 },
  /// Identity of resolver-produced content.
  Synthetic(ContentDigest),
}

/// The observable state of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileState {
  Regular { size: u64, mtime: i64 },
  Special(ContentProxy),
  Nonexistent,
}

impl FileState {
  pub fn exists(&self) -> bool {
    !matches!(self, FileState::Nonexistent)
  }
}

/// Probe the local filesystem for a path's state. This is the fallback
/// used when no resolver is configured.
pub fn probe(path: &Path) -> std::io::Result<FileState> {
  let metadata = match std::fs::metadata(path) {
    Ok(metadata) => metadata,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(FileState::Nonexistent),
    Err(err) => return Err(err),
  };
  let mtime = metadata
    .modified()
    .ok()
    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0);
  if metadata.is_file() {
    Ok(FileState::Regular {
      size: metadata.len(),
      mtime,
    })
  } else {
    Ok(FileState::Special(ContentProxy::Stat {
      size: metadata.len(),
      mtime,
    }))
  }
}
