//! The non-graph-aware fallback globber.
//!
//! One directory walk per invocation, scoped to the package directory and
//! never descending into subpackages (a subdirectory carrying its own
//! `PKG.lua`). Pattern matching runs over the collected entries with one
//! matcher per pattern, in parallel for multi-pattern requests.

use std::collections::BTreeSet;
use std::path::PathBuf;

use globset::GlobBuilder;
use rayon::prelude::*;

use crate::consts::PKG_FILE_NAME;
use crate::globber::{GlobFailure, GlobOperation, validate_pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
  File,
  Dir,
  /// A directory that is itself a package root; only the `Subpackages`
  /// operation sees these.
  Subpackage,
}

/// A synchronous globber over the local filesystem.
#[derive(Debug, Clone)]
pub struct FallbackGlobber {
  pkg_dir: PathBuf,
}

impl FallbackGlobber {
  pub fn new(pkg_dir: PathBuf) -> Self {
    Self { pkg_dir }
  }

  /// Evaluate `patterns` against the package directory.
  ///
  /// With `allow_empty` false, a pattern that matches nothing fails with
  /// the per-pattern empty error before any merging happens.
  pub fn run(
    &self,
    patterns: &[String],
    op: GlobOperation,
    allow_empty: bool,
  ) -> Result<BTreeSet<String>, GlobFailure> {
    let matchers = patterns
      .iter()
      .map(|pattern| compile_matcher(pattern).map(|matcher| (pattern.as_str(), matcher)))
      .collect::<Result<Vec<_>, _>>()?;

    let entries = self.collect_entries()?;

    let per_pattern: Vec<BTreeSet<String>> = matchers
      .par_iter()
      .map(|(pattern, matcher)| {
        let matched: BTreeSet<String> = entries
          .iter()
          .filter(|(_, kind)| op.accepts(matches!(kind, EntryKind::Dir), matches!(kind, EntryKind::Subpackage)))
          .filter(|(rel, _)| matcher.is_match(rel))
          .map(|(rel, _)| rel.clone())
          .collect();
        if !allow_empty && matched.is_empty() {
          return Err(GlobFailure::EmptyResult {
            pattern: pattern.to_string(),
            op,
          });
        }
        Ok(matched)
      })
      .collect::<Result<Vec<_>, _>>()?;

    Ok(per_pattern.into_iter().flatten().collect())
  }

  fn collect_entries(&self) -> Result<Vec<(String, EntryKind)>, GlobFailure> {
    let mut entries = Vec::new();
    let mut walker = walkdir::WalkDir::new(&self.pkg_dir).follow_links(true).into_iter();

    while let Some(entry) = walker.next() {
      let entry = match entry {
        Ok(entry) => entry,
        Err(err) => {
          if let Some(ancestor) = err.loop_ancestor() {
            return Err(GlobFailure::SymlinkCycle(ancestor.display().to_string()));
          }
          return Err(GlobFailure::Io(err.to_string()));
        }
      };
      if entry.depth() == 0 {
        continue;
      }
      let rel = match entry.path().strip_prefix(&self.pkg_dir) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => continue,
      };
      if entry.file_type().is_dir() {
        if entry.path().join(PKG_FILE_NAME).is_file() {
          entries.push((rel, EntryKind::Subpackage));
          // Globs never cross a package boundary.
          walker.skip_current_dir();
        } else {
          entries.push((rel, EntryKind::Dir));
        }
      } else {
        entries.push((rel, EntryKind::File));
      }
    }

    Ok(entries)
  }
}

impl GlobOperation {
  fn accepts(self, is_dir: bool, is_subpackage: bool) -> bool {
    match self {
      GlobOperation::Files => !is_dir && !is_subpackage,
      GlobOperation::FilesAndDirs => !is_subpackage,
      GlobOperation::Subpackages => is_subpackage,
    }
  }
}

fn compile_matcher(pattern: &str) -> Result<globset::GlobMatcher, GlobFailure> {
  validate_pattern(pattern).map_err(|message| GlobFailure::BadPattern {
    pattern: pattern.to_string(),
    message,
  })?;
  let glob = GlobBuilder::new(pattern)
    .literal_separator(true)
    .build()
    .map_err(|err| GlobFailure::BadPattern {
      pattern: pattern.to_string(),
      message: err.to_string(),
    })?;
  Ok(glob.compile_matcher())
}

/// Remove from `matches` exactly the set each exclude pattern would itself
/// match over the same universe.
pub fn remove_excludes(matches: &mut BTreeSet<String>, excludes: &[String]) -> Result<(), GlobFailure> {
  if excludes.is_empty() {
    return Ok(());
  }
  let matchers = excludes.iter().map(|p| compile_matcher(p)).collect::<Result<Vec<_>, _>>()?;
  matches.retain(|candidate| !matchers.iter().any(|matcher| matcher.is_match(candidate)));
  Ok(())
}
