//! Glob evaluation: graph-side glob nodes plus the hybrid globber.
//!
//! The hybrid strategy probes the graph's memoized glob values first and
//! hands exactly the missing patterns to the synchronous fallback globber,
//! so one `glob()` call during program execution never forces a graph
//! restart. Doing the work twice on a clean build is the accepted price;
//! a restart per glob call would cost far more at scale.

pub mod fallback;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::warn;

use crate::error::{LoadError, LoadErrorKind};
use crate::graph::{GraphEnv, GraphKey, GraphValue, Outcome};
use crate::id::PackageId;
use crate::vfs::Root;

pub use fallback::{FallbackGlobber, remove_excludes};

/// What a glob request is for; tags "empty result" errors so the message
/// names the operation that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GlobOperation {
  Files,
  FilesAndDirs,
  Subpackages,
}

impl fmt::Display for GlobOperation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      GlobOperation::Files => write!(f, "glob"),
      GlobOperation::FilesAndDirs => write!(f, "glob with dirs"),
      GlobOperation::Subpackages => write!(f, "subpackages"),
    }
  }
}

/// Everything that can go wrong inside glob evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GlobFailure {
  #[error("invalid glob pattern '{pattern}': {message}")]
  BadPattern { pattern: String, message: String },

  #[error("{op} pattern '{pattern}' didn't match anything")]
  EmptyResult { pattern: String, op: GlobOperation },

  #[error("every match of this {op} was excluded, but allow_empty is not set")]
  AllExcluded { op: GlobOperation },

  #[error("symlink cycle under '{0}'")]
  SymlinkCycle(String),

  #[error("{0}")]
  Io(String),
}

impl GlobFailure {
  /// Whether this failure came from touching the filesystem (as opposed
  /// to a malformed or empty pattern).
  pub fn is_io(&self) -> bool {
    matches!(self, GlobFailure::Io(_) | GlobFailure::SymlinkCycle(_))
  }

  pub fn to_load_error(&self) -> LoadError {
    match self {
      GlobFailure::BadPattern { .. } | GlobFailure::EmptyResult { .. } | GlobFailure::AllExcluded { .. } => {
        LoadError::persistent(LoadErrorKind::BadGlob(self.to_string()))
      }
      GlobFailure::SymlinkCycle(path) => {
        LoadError::persistent(LoadErrorKind::SymlinkCycle(path.clone()))
      }
      GlobFailure::Io(message) => LoadError::transient(LoadErrorKind::Io(message.clone())),
    }
  }
}

/// Syntactic validation of one pattern; matcher compilation does the rest.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
  if pattern.is_empty() {
    return Err("pattern cannot be empty".to_string());
  }
  if pattern.starts_with('/') {
    return Err("pattern cannot be absolute".to_string());
  }
  if pattern.contains('\\') {
    return Err("pattern cannot contain '\\'; use '/' as the separator".to_string());
  }
  for segment in pattern.split('/') {
    if segment.is_empty() {
      return Err("pattern cannot contain empty segments".to_string());
    }
    if segment == "." || segment == ".." {
      return Err("pattern cannot contain '.' or '..' segments".to_string());
    }
    if segment.contains("**") && segment != "**" {
      return Err("'**' must be a complete path segment".to_string());
    }
  }
  Ok(())
}

/// The per-pattern graph key payload: (package, root, pattern, operation).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobDescriptor {
  pub pkg: PackageId,
  pub root: Root,
  pub pattern: String,
  pub op: GlobOperation,
}

impl GlobDescriptor {
  /// Build a descriptor, failing immediately on a malformed pattern.
  pub fn new(pkg: PackageId, root: Root, pattern: &str, op: GlobOperation) -> Result<Self, GlobFailure> {
    validate_pattern(pattern).map_err(|message| GlobFailure::BadPattern {
      pattern: pattern.to_string(),
      message,
    })?;
    Ok(Self {
      pkg,
      root,
      pattern: pattern.to_string(),
      op,
    })
  }
}

/// Node function for one pattern's match set.
pub fn glob_fn(descriptor: &GlobDescriptor) -> Result<Outcome<GraphValue>, LoadError> {
  let dir = descriptor.root.join(descriptor.pkg.path().as_str());
  let globber = FallbackGlobber::new(dir);
  match globber.run(std::slice::from_ref(&descriptor.pattern), descriptor.op, true) {
    Ok(matches) => Ok(Outcome::Ready(GraphValue::Glob(Arc::new(matches)))),
    Err(failure) => Err(failure.to_load_error()),
  }
}

/// Correlates one `begin` call with its eventual match set. Single-use and
/// owned by the invocation that created it.
#[derive(Debug)]
pub struct GlobToken {
  resolved: Vec<(String, Arc<BTreeSet<String>>)>,
  fallback: Option<JoinHandle<Result<BTreeSet<String>, GlobFailure>>>,
  excludes: Vec<String>,
  op: GlobOperation,
  allow_empty: bool,
}

/// The graph-first globber with synchronous fallback.
pub struct HybridGlobber {
  pkg: PackageId,
  root: Root,
  pkg_dir: PathBuf,
  /// Every glob key this globber ever issued, fallback-delegated ones
  /// included; the loader records them all as formal dependencies.
  /// Fallback completion may race further `begin` calls, hence the lock.
  deps: Mutex<BTreeSet<GraphKey>>,
}

impl HybridGlobber {
  pub fn new(pkg: PackageId, root: Root) -> Self {
    let pkg_dir = root.join(pkg.path().as_str());
    Self {
      pkg,
      root,
      pkg_dir,
      deps: Mutex::new(BTreeSet::new()),
    }
  }

  /// Issue one batched graph request for all include patterns and start
  /// the fallback globber for the misses. Returns immediately.
  pub fn begin(
    &self,
    env: &mut dyn GraphEnv,
    includes: &[String],
    excludes: &[String],
    op: GlobOperation,
    allow_empty: bool,
  ) -> Result<GlobToken, GlobFailure> {
    let mut keys = Vec::with_capacity(includes.len());
    for pattern in includes {
      let descriptor = GlobDescriptor::new(self.pkg.clone(), self.root.clone(), pattern, op)?;
      keys.push(GraphKey::Glob(descriptor));
    }

    {
      let mut deps = self.deps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
      deps.extend(keys.iter().cloned());
    }

    let batch = env.batch_lookup(&keys);

    let mut resolved = Vec::new();
    let mut delegated = Vec::new();
    for (pattern, key) in includes.iter().zip(&keys) {
      match batch.entries.get(key) {
        Some(Ok(value)) => match value.as_glob() {
          Some(matches) => resolved.push((pattern.clone(), matches.clone())),
          None => delegated.push(pattern.clone()),
        },
        Some(Err(error)) => {
          // The error stays attached to the glob node; the loader's
          // dependency re-check surfaces it with proper classification.
          warn!(pattern = pattern.as_str(), error = %error, "glob dependency failed");
        }
        None => delegated.push(pattern.clone()),
      }
    }

    let fallback = if delegated.is_empty() {
      None
    } else {
      let globber = FallbackGlobber::new(self.pkg_dir.clone());
      Some(std::thread::spawn(move || {
        globber.run(&delegated, op, allow_empty)
      }))
    };

    Ok(GlobToken {
      resolved,
      fallback,
      excludes: excludes.to_vec(),
      op,
      allow_empty,
    })
  }

  /// Merge graph and fallback results, apply excludes, enforce the
  /// non-empty policy. Blocks on the fallback globber but never on the
  /// graph.
  pub fn resolve(&self, token: GlobToken) -> Result<BTreeSet<String>, GlobFailure> {
    let mut matches = BTreeSet::new();
    for (pattern, per_pattern) in &token.resolved {
      if !token.allow_empty && per_pattern.is_empty() {
        return Err(GlobFailure::EmptyResult {
          pattern: pattern.clone(),
          op: token.op,
        });
      }
      matches.extend(per_pattern.iter().cloned());
    }

    if let Some(handle) = token.fallback {
      let fallback_matches = handle
        .join()
        .map_err(|_| GlobFailure::Io("fallback globber thread panicked".to_string()))??;
      matches.extend(fallback_matches);
    }

    remove_excludes(&mut matches, &token.excludes)?;

    if !token.allow_empty && matches.is_empty() {
      return Err(GlobFailure::AllExcluded { op: token.op });
    }
    Ok(matches)
  }

  /// All glob keys issued so far.
  pub fn deps_requested(&self) -> BTreeSet<GraphKey> {
    self
      .deps
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }
}
