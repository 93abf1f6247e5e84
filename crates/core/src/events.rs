//! The diagnostics channel: structured events and posted notifications.
//!
//! Events accumulate in the package builder during execution and are
//! replayed to the [`Reporter`] exactly once when a construction
//! finalizes, so a restarted construction never double-reports.

use loadstone_lua::Location;

use crate::id::PackageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Error,
  Warning,
  Progress,
  Debug,
}

/// One structured diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
  pub severity: Severity,
  /// File and position the event refers to, if any.
  pub location: Option<(String, Location)>,
  pub message: String,
}

impl Event {
  pub fn error(location: Option<(String, Location)>, message: impl Into<String>) -> Self {
    Self {
      severity: Severity::Error,
      location,
      message: message.into(),
    }
  }

  pub fn warning(message: impl Into<String>) -> Self {
    Self {
      severity: Severity::Warning,
      location: None,
      message: message.into(),
    }
  }

  pub fn progress(message: impl Into<String>) -> Self {
    Self {
      severity: Severity::Progress,
      location: None,
      message: message.into(),
    }
  }
}

/// A notification posted on successful finalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Postable {
  PackageLoaded {
    id: PackageId,
    targets: usize,
    contains_errors: bool,
  },
}

/// The sink events and posts are replayed into.
pub trait Reporter {
  fn handle(&mut self, event: &Event);
  fn post(&mut self, postable: &Postable);
}

/// A reporter that keeps everything; used by tests and by callers that
/// want to inspect diagnostics after the fact.
#[derive(Debug, Default)]
pub struct CollectingReporter {
  pub events: Vec<Event>,
  pub posts: Vec<Postable>,
}

impl Reporter for CollectingReporter {
  fn handle(&mut self, event: &Event) {
    self.events.push(event.clone());
  }

  fn post(&mut self, postable: &Postable) {
    self.posts.push(postable.clone());
  }
}

/// A reporter that drops everything.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
  fn handle(&mut self, _event: &Event) {}

  fn post(&mut self, _postable: &Postable) {}
}
