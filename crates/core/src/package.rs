//! Targets, the package builder, and the finished package.
//!
//! The builder accumulates targets and diagnostics while the program runs.
//! `build_partial` freezes the target set into a label-indexed form for
//! the boundary pass; `finish_build` is the terminal, immutable snapshot.
//! Once `contains_errors` is set it is never cleared, and an errored
//! package still carries every successfully registered target so
//! downstream tooling can work with partial information.

use std::collections::BTreeMap;

use loadstone_lua::{Location, TargetDecl, Value};

use crate::events::{Event, Postable};
use crate::globber::GlobFailure;
use crate::id::{Label, PackageId};
use crate::vfs::RootedPath;

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
  pub label: Label,
  pub kind: String,
  pub location: Option<Location>,
  pub attrs: BTreeMap<String, Value>,
}

/// The immutable result of a construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
  pub id: PackageId,
  pub build_file: RootedPath,
  pub targets: BTreeMap<Label, Target>,
  pub contains_errors: bool,
  pub events: Vec<Event>,
  /// Call-site annotations: the callee name of every top-level call in the
  /// description file, keyed by source location.
  pub annotations: BTreeMap<Location, String>,
}

impl Package {
  pub fn target(&self, name: &str) -> Option<&Target> {
    self.targets.iter().find(|(label, _)| label.name == name).map(|(_, t)| t)
  }
}

/// Mutable accumulation state for one construction.
pub struct PackageBuilder {
  id: PackageId,
  build_file: RootedPath,
  /// Registration order, before `build_partial`.
  pending: Vec<Target>,
  /// Label-indexed, after `build_partial`.
  indexed: Option<BTreeMap<Label, Target>>,
  events: Vec<Event>,
  posts: Vec<Postable>,
  contains_errors: bool,
  /// An IO failure observed by the fallback globber during execution;
  /// re-raised by `build_partial` like the original observation point.
  io_failure: Option<GlobFailure>,
  /// Call-site annotations extracted at compile time.
  annotations: BTreeMap<Location, String>,
}

impl PackageBuilder {
  pub fn new(id: PackageId, build_file: RootedPath) -> Self {
    Self {
      id,
      build_file,
      pending: Vec::new(),
      indexed: None,
      events: Vec::new(),
      posts: Vec::new(),
      contains_errors: false,
      io_failure: None,
      annotations: BTreeMap::new(),
    }
  }

  pub fn id(&self) -> &PackageId {
    &self.id
  }

  pub fn set_annotations(&mut self, annotations: BTreeMap<Location, String>) {
    self.annotations = annotations;
  }

  pub fn annotations(&self) -> &BTreeMap<Location, String> {
    &self.annotations
  }

  /// Register a target. Fails on duplicate names and invalid label names;
  /// the caller surfaces the message into the program.
  pub fn add_target(&mut self, decl: TargetDecl) -> Result<(), String> {
    let label = Label::new(self.id.clone(), &decl.name)?;
    let duplicate = match &self.indexed {
      Some(indexed) => indexed.contains_key(&label),
      None => self.pending.iter().any(|t| t.label == label),
    };
    if duplicate {
      return Err(format!(
        "target '{}' is declared twice in package '{}'",
        decl.name, self.id
      ));
    }
    self.pending.push(Target {
      label,
      kind: decl.kind,
      location: None,
      attrs: decl.attrs,
    });
    Ok(())
  }

  pub fn add_event(&mut self, event: Event) {
    self.events.push(event);
  }

  pub fn post(&mut self, postable: Postable) {
    self.posts.push(postable);
  }

  /// Sticky: never cleared once set.
  pub fn set_contains_errors(&mut self) {
    self.contains_errors = true;
  }

  pub fn contains_errors(&self) -> bool {
    self.contains_errors
  }

  pub fn set_io_failure(&mut self, failure: GlobFailure) {
    if self.io_failure.is_none() {
      self.io_failure = Some(failure);
    }
  }

  /// Freeze the registration list into a label-indexed set. Re-raises any
  /// deferred globbing IO failure; idempotent otherwise, so a restarted
  /// construction may call it again.
  pub fn build_partial(&mut self) -> Result<(), GlobFailure> {
    if self.indexed.is_none() {
      let mut indexed = BTreeMap::new();
      for target in self.pending.drain(..) {
        indexed.insert(target.label.clone(), target);
      }
      self.indexed = Some(indexed);
    }
    match &self.io_failure {
      Some(failure) => Err(failure.clone()),
      None => Ok(()),
    }
  }

  /// Labels of the indexed target set; empty before `build_partial`.
  pub fn indexed_labels(&self) -> Vec<Label> {
    match &self.indexed {
      Some(indexed) => indexed.keys().cloned().collect(),
      None => Vec::new(),
    }
  }

  /// Drop a target by label (a boundary violation). Only meaningful after
  /// `build_partial`.
  pub fn remove_target(&mut self, label: &Label) -> bool {
    match &mut self.indexed {
      Some(indexed) => indexed.remove(label).is_some(),
      None => false,
    }
  }

  pub fn events(&self) -> &[Event] {
    &self.events
  }

  pub fn posts(&self) -> &[Postable] {
    &self.posts
  }

  pub fn target_count(&self) -> usize {
    match &self.indexed {
      Some(indexed) => indexed.len(),
      None => self.pending.len(),
    }
  }

  /// The terminal transition to the immutable package.
  pub fn finish_build(mut self) -> Package {
    if self.indexed.is_none() {
      let mut indexed = BTreeMap::new();
      for target in self.pending.drain(..) {
        indexed.insert(target.label.clone(), target);
      }
      self.indexed = Some(indexed);
    }
    Package {
      id: self.id,
      build_file: self.build_file,
      targets: self.indexed.unwrap_or_default(),
      contains_errors: self.contains_errors,
      events: self.events,
      annotations: self.annotations,
    }
  }
}
