//! Content digests for synthetic file identity.
//!
//! Virtual files have no inode or mtime; their change identity is a
//! truncated SHA-256 of whatever the resolver produced.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Truncated hex digest length; enough to distinguish revisions while
/// keeping debug output readable.
const DIGEST_PREFIX_LEN: usize = 20;

/// A truncated content digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentDigest(pub String);

impl fmt::Display for ContentDigest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Digest arbitrary bytes.
pub fn digest_bytes(bytes: &[u8]) -> ContentDigest {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  let full = hex::encode(hasher.finalize());
  ContentDigest(full[..DIGEST_PREFIX_LEN].to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn digests_are_stable_and_distinct() {
    let a = digest_bytes(b"contents");
    let b = digest_bytes(b"contents");
    let c = digest_bytes(b"other contents");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.0.len(), DIGEST_PREFIX_LEN);
  }
}
