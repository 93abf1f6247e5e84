//! Test support: a graph environment backed by a static value map.

use std::collections::BTreeMap;

use crate::error::LoadError;
use crate::events::{CollectingReporter, Reporter};
use crate::graph::{BatchResult, ComputeState, GraphEnv, GraphKey, GraphValue, Outcome};

/// A [`GraphEnv`] whose values are seeded up front. Lookups for unseeded
/// keys record a missing dependency and report pending, exactly like the
/// real engine on a first pass.
#[derive(Default)]
pub struct StaticEnv {
  values: BTreeMap<GraphKey, Result<GraphValue, LoadError>>,
  missing: Vec<GraphKey>,
  state: ComputeState,
  pub reporter: CollectingReporter,
}

impl StaticEnv {
  pub fn insert(&mut self, key: GraphKey, value: Result<GraphValue, LoadError>) {
    self.values.insert(key, value);
  }

  pub fn missing_requested(&self) -> &[GraphKey] {
    &self.missing
  }
}

impl GraphEnv for StaticEnv {
  fn lookup(&mut self, key: &GraphKey) -> Result<Outcome<GraphValue>, LoadError> {
    match self.values.get(key) {
      Some(Ok(value)) => Ok(Outcome::Ready(value.clone())),
      Some(Err(error)) => Err(error.clone()),
      None => {
        self.missing.push(key.clone());
        Ok(Outcome::Pending)
      }
    }
  }

  fn batch_lookup(&mut self, keys: &[GraphKey]) -> BatchResult {
    let mut result = BatchResult::default();
    for key in keys {
      match self.values.get(key) {
        Some(entry) => {
          result.entries.insert(key.clone(), entry.clone());
        }
        None => {
          self.missing.push(key.clone());
          result.missing.insert(key.clone());
        }
      }
    }
    result
  }

  fn values_missing(&self) -> bool {
    !self.missing.is_empty()
  }

  fn state(&mut self) -> &mut ComputeState {
    &mut self.state
  }

  fn reporter(&mut self) -> &mut dyn Reporter {
    &mut self.reporter
  }
}
