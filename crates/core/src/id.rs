//! Repository-qualified package identifiers and target labels.
//!
//! `PackageId` values are interned: equal identifiers share one allocation
//! for the lifetime of the process, and equality, ordering and hashing
//! depend only on `(repository, path, maybe_virtual)`. The intern table is
//! append-only; identifiers are immutable once constructed.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// A validated repository name. The main repository has the empty name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoName(Arc<str>);

impl RepoName {
  /// The main (workspace) repository.
  pub fn main() -> Self {
    Self(Arc::from(""))
  }

  pub fn new(name: &str) -> Result<Self, String> {
    if name.is_empty() {
      return Ok(Self::main());
    }
    if !name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
      return Err(format!(
        "invalid repository name '{}': names may contain only letters, digits, '-', '_' and '.'",
        name
      ));
    }
    Ok(Self(Arc::from(name)))
  }

  pub fn is_main(&self) -> bool {
    self.0.is_empty()
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RepoName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_main() {
      Ok(())
    } else {
      write!(f, "@{}", self.0)
    }
  }
}

/// A normalized, `/`-separated, repository-relative package path. The empty
/// path names the package at the repository root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PkgPath(Arc<str>);

impl PkgPath {
  pub fn root() -> Self {
    Self(Arc::from(""))
  }

  pub fn new(path: &str) -> Result<Self, String> {
    validate_package_path(path)?;
    Ok(Self(Arc::from(path)))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.0.split('/').filter(|s| !s.is_empty())
  }

  /// The parent directory, or `None` at the repository root.
  pub fn parent(&self) -> Option<PkgPath> {
    if self.is_root() {
      return None;
    }
    match self.0.rsplit_once('/') {
      Some((parent, _)) => Some(Self(Arc::from(parent))),
      None => Some(Self::root()),
    }
  }

  /// Append one or more normalized segments.
  pub fn join(&self, rel: &str) -> PkgPath {
    if self.is_root() {
      Self(Arc::from(rel))
    } else if rel.is_empty() {
      self.clone()
    } else {
      Self(Arc::from(format!("{}/{}", self.0, rel).as_str()))
    }
  }

  /// Whether `self` equals `prefix` or sits beneath it.
  pub fn starts_with(&self, prefix: &PkgPath) -> bool {
    if prefix.is_root() {
      return true;
    }
    self.0 == prefix.0 || self.0.starts_with(&format!("{}/", prefix.0))
  }

  /// This path and each of its ancestors, nearest first, ending at the
  /// repository root.
  pub fn self_and_ancestors(&self) -> Vec<PkgPath> {
    let mut out = vec![self.clone()];
    let mut current = self.clone();
    while let Some(parent) = current.parent() {
      out.push(parent.clone());
      current = parent;
    }
    out
  }
}

impl fmt::Display for PkgPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Validate a package path, returning a remediation-oriented message.
pub fn validate_package_path(path: &str) -> Result<(), String> {
  if path.is_empty() {
    return Ok(());
  }
  if path.starts_with('/') || path.ends_with('/') {
    return Err(format!(
      "invalid package name '{}': package names may not start or end with '/'",
      path
    ));
  }
  for segment in path.split('/') {
    if segment.is_empty() {
      return Err(format!(
        "invalid package name '{}': package names may not contain '//'",
        path
      ));
    }
    if segment == "." || segment == ".." {
      return Err(format!(
        "invalid package name '{}': package names may not contain '.' or '..' segments",
        path
      ));
    }
    if !segment
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '@' | '~'))
    {
      return Err(format!(
        "invalid package name '{}': segment '{}' contains forbidden characters",
        path, segment
      ));
    }
  }
  Ok(())
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct PackageIdData {
  repo: RepoName,
  path: PkgPath,
  maybe_virtual: bool,
}

/// An interned package identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(Arc<PackageIdData>);

impl PackageId {
  pub fn new(repo: RepoName, path: PkgPath, maybe_virtual: bool) -> Self {
    Self(intern(PackageIdData {
      repo,
      path,
      maybe_virtual,
    }))
  }

  /// An identifier in the main repository without virtual lookup.
  pub fn in_main(path: PkgPath) -> Self {
    Self::new(RepoName::main(), path, false)
  }

  pub fn repo(&self) -> &RepoName {
    &self.0.repo
  }

  pub fn path(&self) -> &PkgPath {
    &self.0.path
  }

  pub fn maybe_virtual(&self) -> bool {
    self.0.maybe_virtual
  }

  /// The same identifier with a different virtual-lookup flag.
  pub fn with_maybe_virtual(&self, maybe_virtual: bool) -> Self {
    if self.0.maybe_virtual == maybe_virtual {
      self.clone()
    } else {
      Self::new(self.0.repo.clone(), self.0.path.clone(), maybe_virtual)
    }
  }
}

impl fmt::Display for PackageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}//{}", self.0.repo, self.0.path)
  }
}

fn intern(data: PackageIdData) -> Arc<PackageIdData> {
  static TABLE: OnceLock<Mutex<HashSet<Arc<PackageIdData>>>> = OnceLock::new();
  let table = TABLE.get_or_init(|| Mutex::new(HashSet::new()));
  let mut table = table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  if let Some(existing) = table.get(&data) {
    return existing.clone();
  }
  let arc = Arc::new(data);
  table.insert(arc.clone());
  arc
}

/// A target label: a package plus a target name. Names may contain `/`,
/// which is what makes subpackage-boundary checking necessary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
  pub pkg: PackageId,
  pub name: String,
}

impl Label {
  pub fn new(pkg: PackageId, name: &str) -> Result<Self, String> {
    validate_target_name(name)?;
    Ok(Self {
      pkg,
      name: name.to_string(),
    })
  }

  /// The directory containing the file this label names: the package path
  /// joined with the directory part of the target name.
  pub fn containing_dir(&self) -> PkgPath {
    match self.name.rsplit_once('/') {
      Some((dir, _)) => self.pkg.path().join(dir),
      None => self.pkg.path().clone(),
    }
  }
}

impl fmt::Display for Label {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.pkg, self.name)
  }
}

pub fn validate_target_name(name: &str) -> Result<(), String> {
  if name.is_empty() {
    return Err("target names may not be empty".to_string());
  }
  if name.starts_with('/') || name.ends_with('/') {
    return Err(format!(
      "invalid target name '{}': names may not start or end with '/'",
      name
    ));
  }
  for segment in name.split('/') {
    if segment.is_empty() || segment == "." || segment == ".." {
      return Err(format!(
        "invalid target name '{}': names may not contain empty, '.' or '..' segments",
        name
      ));
    }
  }
  Ok(())
}

/// Resolve a module reference as written in an `import()` call into a
/// repository plus repository-relative file path.
///
/// Accepted shapes, mirroring label syntax:
/// - `//tools/defs.lua` or `//tools:defs.lua` — relative to the importing
///   package's repository root,
/// - `@repo//tools/defs.lua` — another repository,
/// - `defs.lua` or `:defs.lua` — relative to the importing package.
pub fn parse_module_ref(reference: &str, pkg: &PackageId) -> Result<(RepoName, String), String> {
  let (repo, rest) = if let Some(rest) = reference.strip_prefix("@") {
    let (repo_name, rest) = rest
      .split_once("//")
      .ok_or_else(|| format!("invalid module reference '{}': expected '@repo//path'", reference))?;
    (RepoName::new(repo_name)?, rest.to_string())
  } else if let Some(rest) = reference.strip_prefix("//") {
    (pkg.repo().clone(), rest.to_string())
  } else {
    let rel = reference.strip_prefix(':').unwrap_or(reference);
    let base = pkg.path();
    let joined = if base.is_root() {
      rel.to_string()
    } else {
      format!("{}/{}", base.as_str(), rel)
    };
    (pkg.repo().clone(), joined)
  };

  let path = rest.replace(':', "/");
  if path.is_empty() {
    return Err(format!("invalid module reference '{}': empty path", reference));
  }
  for segment in path.split('/') {
    if segment.is_empty() || segment == "." || segment == ".." {
      return Err(format!(
        "invalid module reference '{}': paths may not contain empty, '.' or '..' segments",
        reference
      ));
    }
  }
  Ok((repo, path))
}
