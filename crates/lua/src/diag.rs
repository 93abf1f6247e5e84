//! Source locations and syntax diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in a source file. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
  pub line: u32,
  pub col: u32,
}

impl Location {
  pub fn new(line: u32, col: u32) -> Self {
    Self { line, col }
  }
}

impl fmt::Display for Location {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.line, self.col)
  }
}

/// A syntax problem in a description file.
///
/// Syntax errors are carried as data, never thrown: a file that fails to
/// scan or compile produces a list of these and an errored (but still
/// inspectable) package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxError {
  /// Display name of the file the error was found in.
  pub file: String,
  /// Position of the offending token, if known.
  pub location: Option<Location>,
  pub message: String,
}

impl SyntaxError {
  pub fn new(file: impl Into<String>, location: Option<Location>, message: impl Into<String>) -> Self {
    Self {
      file: file.into(),
      location,
      message: message.into(),
    }
  }
}

impl fmt::Display for SyntaxError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.location {
      Some(loc) => write!(f, "{}:{}: {}", self.file, loc, self.message),
      None => write!(f, "{}: {}", self.file, self.message),
    }
  }
}
