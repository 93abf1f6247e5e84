//! A small demand-driven, memoizing, restarting evaluator.
//!
//! This is the in-process stand-in for the surrounding graph engine: it
//! owns the memo table, per-node dependency edges, and the per-request
//! compute state, and it re-invokes a suspended node after evaluating the
//! dependencies it declared missing. Restarting re-runs the node function
//! from the top; nothing is resumed from a continuation.
//!
//! Errors are memoized alongside values. Transient errors stay until
//! [`MemoEngine::retry_transient`] sweeps them (the "retried on a later
//! build" contract); persistent errors stay until their node is
//! invalidated.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{LoadError, LoadErrorKind};
use crate::events::Reporter;
use crate::graph::{BatchResult, ComputeState, GraphEnv, GraphKey, GraphValue, Outcome};

/// Upper bound on restarts of a single node; a node that suspends more
/// often than this is stuck declaring dependencies it never consumes.
const MAX_RESTARTS_PER_NODE: usize = 10_000;

/// The dispatch table: one function per [`GraphKey`] kind.
pub trait GraphFns {
  fn compute(&self, key: &GraphKey, env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError>;
}

pub struct MemoEngine {
  funcs: Box<dyn GraphFns>,
  memo: HashMap<GraphKey, Result<GraphValue, LoadError>>,
  graph: DiGraph<GraphKey, ()>,
  nodes: HashMap<GraphKey, NodeIndex>,
  states: HashMap<GraphKey, ComputeState>,
  in_progress: Vec<GraphKey>,
  restarts: usize,
}

impl MemoEngine {
  pub fn new(funcs: Box<dyn GraphFns>) -> Self {
    Self {
      funcs,
      memo: HashMap::new(),
      graph: DiGraph::new(),
      nodes: HashMap::new(),
      states: HashMap::new(),
      in_progress: Vec::new(),
      restarts: 0,
    }
  }

  /// Demand a value, computing (and memoizing) it if necessary.
  pub fn evaluate(&mut self, key: &GraphKey, reporter: &mut dyn Reporter) -> Result<GraphValue, LoadError> {
    if let Some(result) = self.memo.get(key) {
      return result.clone();
    }
    if self.in_progress.contains(key) {
      return Err(LoadError::persistent(LoadErrorKind::NoSuchPackage(format!(
        "dependency cycle detected at {:?}",
        key
      ))));
    }

    self.in_progress.push(key.clone());
    let mut dep_keys: BTreeSet<GraphKey> = BTreeSet::new();
    let mut node_restarts = 0;

    let result = loop {
      let mut missing: Vec<GraphKey> = Vec::new();
      let outcome = {
        let state = self.states.entry(key.clone()).or_default();
        let mut env = EngineEnv {
          memo: &self.memo,
          missing: &mut missing,
          deps: &mut dep_keys,
          state,
          reporter: &mut *reporter,
        };
        self.funcs.compute(key, &mut env)
      };

      match outcome {
        Ok(Outcome::Ready(value)) => break Ok(value),
        Err(error) => break Err(error),
        Ok(Outcome::Pending) => {
          if missing.is_empty() {
            break Err(LoadError::persistent(LoadErrorKind::Io(format!(
              "node {:?} suspended without declaring missing dependencies",
              key
            ))));
          }
          node_restarts += 1;
          self.restarts += 1;
          if node_restarts > MAX_RESTARTS_PER_NODE {
            break Err(LoadError::persistent(LoadErrorKind::Io(format!(
              "node {:?} exceeded the restart budget",
              key
            ))));
          }
          missing.sort();
          missing.dedup();
          let mut refused: Option<LoadError> = None;
          for dep in &missing {
            // Dep failures are memoized; the restarted parent observes
            // them through its next lookup. A dep that failed without
            // being memoized refused to evaluate (it cycled back into
            // this stack) and fails the parent directly.
            if let Err(error) = self.evaluate(dep, reporter) {
              if !self.memo.contains_key(dep) {
                refused = Some(error);
                break;
              }
            }
          }
          if let Some(error) = refused {
            break Err(error);
          }
        }
      }
    };

    self.in_progress.pop();
    self.record_deps(key, &dep_keys);
    // Terminal transition: the compute-state scratch dies here.
    self.states.remove(key);
    self.memo.insert(key.clone(), result.clone());
    result
  }

  fn node_index(&mut self, key: &GraphKey) -> NodeIndex {
    if let Some(index) = self.nodes.get(key) {
      return *index;
    }
    let index = self.graph.add_node(key.clone());
    self.nodes.insert(key.clone(), index);
    index
  }

  fn record_deps(&mut self, key: &GraphKey, deps: &BTreeSet<GraphKey>) {
    let dependent = self.node_index(key);
    for dep in deps {
      let dep_index = self.node_index(dep);
      // Edge from dependency to dependent so invalidation walks forward.
      self.graph.update_edge(dep_index, dependent, ());
    }
  }

  /// Drop a node's memoized value along with every transitive dependent.
  pub fn invalidate(&mut self, key: &GraphKey) {
    let Some(&start) = self.nodes.get(key) else {
      self.memo.remove(key);
      return;
    };
    let mut queue = vec![start];
    let mut seen = BTreeSet::new();
    while let Some(index) = queue.pop() {
      if !seen.insert(index) {
        continue;
      }
      self.memo.remove(&self.graph[index]);
      queue.extend(self.graph.neighbors_directed(index, Direction::Outgoing));
    }
  }

  /// Sweep transiently failed nodes (and their dependents) so the next
  /// evaluation retries them.
  pub fn retry_transient(&mut self) {
    let transient: Vec<GraphKey> = self
      .memo
      .iter()
      .filter_map(|(key, result)| match result {
        Err(error) if error.is_transient() => Some(key.clone()),
        _ => None,
      })
      .collect();
    for key in transient {
      self.invalidate(&key);
    }
  }

  /// Total number of node restarts since construction; visible so callers
  /// (and tests) can observe restart behavior.
  pub fn restarts(&self) -> usize {
    self.restarts
  }

  pub fn is_memoized(&self, key: &GraphKey) -> bool {
    self.memo.contains_key(key)
  }

  /// The dependencies recorded for a node, for invalidation introspection.
  pub fn deps_of(&self, key: &GraphKey) -> BTreeSet<GraphKey> {
    let Some(&index) = self.nodes.get(key) else {
      return BTreeSet::new();
    };
    self
      .graph
      .neighbors_directed(index, Direction::Incoming)
      .map(|dep| self.graph[dep].clone())
      .collect()
  }
}

struct EngineEnv<'a> {
  memo: &'a HashMap<GraphKey, Result<GraphValue, LoadError>>,
  missing: &'a mut Vec<GraphKey>,
  deps: &'a mut BTreeSet<GraphKey>,
  state: &'a mut ComputeState,
  reporter: &'a mut dyn Reporter,
}

impl GraphEnv for EngineEnv<'_> {
  fn lookup(&mut self, key: &GraphKey) -> Result<Outcome<GraphValue>, LoadError> {
    self.deps.insert(key.clone());
    match self.memo.get(key) {
      Some(Ok(value)) => Ok(Outcome::Ready(value.clone())),
      Some(Err(error)) => Err(error.clone()),
      None => {
        self.missing.push(key.clone());
        Ok(Outcome::Pending)
      }
    }
  }

  fn batch_lookup(&mut self, keys: &[GraphKey]) -> BatchResult {
    let mut result = BatchResult {
      entries: BTreeMap::new(),
      missing: BTreeSet::new(),
    };
    for key in keys {
      self.deps.insert(key.clone());
      match self.memo.get(key) {
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
    self.state
  }

  fn reporter(&mut self) -> &mut dyn Reporter {
    self.reporter
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::CollectingReporter;
  use crate::vfs::{FileState, Root, RootedPath};
  use std::cell::Cell;
  use std::rc::Rc;

  fn key(name: &str) -> GraphKey {
    GraphKey::FileState(RootedPath::new(Root::new("/test"), name))
  }

  fn leaf_value() -> GraphValue {
    GraphValue::FileState(FileState::Nonexistent)
  }

  /// `a` needs `b` and `c`; `b` needs `c`; `c` is a leaf. Counts
  /// invocations per key.
  struct DiamondFns {
    invocations: Rc<Cell<usize>>,
  }

  impl GraphFns for DiamondFns {
    fn compute(&self, k: &GraphKey, env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError> {
      self.invocations.set(self.invocations.get() + 1);
      if *k == key("a") {
        let b = env.lookup(&key("b"))?;
        let c = env.lookup(&key("c"))?;
        if b.is_pending() || c.is_pending() {
          return Ok(Outcome::Pending);
        }
        Ok(Outcome::Ready(leaf_value()))
      } else if *k == key("b") {
        match env.lookup(&key("c"))? {
          Outcome::Pending => Ok(Outcome::Pending),
          Outcome::Ready(_) => Ok(Outcome::Ready(leaf_value())),
        }
      } else {
        Ok(Outcome::Ready(leaf_value()))
      }
    }
  }

  #[test]
  fn restarts_resume_and_memoize() {
    let invocations = Rc::new(Cell::new(0));
    let mut engine = MemoEngine::new(Box::new(DiamondFns {
      invocations: invocations.clone(),
    }));
    let mut reporter = CollectingReporter::default();

    engine.evaluate(&key("a"), &mut reporter).unwrap();
    // a (pending), b (pending), c, b, a: five invocations, two restarts.
    assert_eq!(invocations.get(), 5);
    assert!(engine.restarts() >= 2);

    // Everything is memoized now; a second demand costs nothing.
    engine.evaluate(&key("a"), &mut reporter).unwrap();
    assert_eq!(invocations.get(), 5);
  }

  #[test]
  fn invalidation_sweeps_dependents() {
    let invocations = Rc::new(Cell::new(0));
    let mut engine = MemoEngine::new(Box::new(DiamondFns {
      invocations: invocations.clone(),
    }));
    let mut reporter = CollectingReporter::default();
    engine.evaluate(&key("a"), &mut reporter).unwrap();

    engine.invalidate(&key("c"));
    assert!(!engine.is_memoized(&key("c")));
    assert!(!engine.is_memoized(&key("b")));
    assert!(!engine.is_memoized(&key("a")));

    engine.evaluate(&key("a"), &mut reporter).unwrap();
    assert!(engine.is_memoized(&key("a")));
  }

  #[test]
  fn dependency_edges_are_recorded() {
    let invocations = Rc::new(Cell::new(0));
    let mut engine = MemoEngine::new(Box::new(DiamondFns { invocations }));
    let mut reporter = CollectingReporter::default();
    engine.evaluate(&key("a"), &mut reporter).unwrap();

    let deps = engine.deps_of(&key("a"));
    assert!(deps.contains(&key("b")));
    assert!(deps.contains(&key("c")));
  }

  struct FailingFns;

  impl GraphFns for FailingFns {
    fn compute(&self, k: &GraphKey, _env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError> {
      if *k == key("transient") {
        Err(LoadError::transient(LoadErrorKind::Io("flake".to_string())))
      } else {
        Err(LoadError::persistent(LoadErrorKind::Io("broken".to_string())))
      }
    }
  }

  #[test]
  fn transient_errors_cleared_by_retry_sweep() {
    let mut engine = MemoEngine::new(Box::new(FailingFns));
    let mut reporter = CollectingReporter::default();

    assert!(engine.evaluate(&key("transient"), &mut reporter).is_err());
    assert!(engine.evaluate(&key("persistent"), &mut reporter).is_err());
    assert!(engine.is_memoized(&key("transient")));

    engine.retry_transient();
    assert!(!engine.is_memoized(&key("transient")));
    assert!(engine.is_memoized(&key("persistent")));
  }

  struct CycleFns;

  impl GraphFns for CycleFns {
    fn compute(&self, k: &GraphKey, env: &mut dyn GraphEnv) -> Result<Outcome<GraphValue>, LoadError> {
      let other = if *k == key("x") { key("y") } else { key("x") };
      match env.lookup(&other)? {
        Outcome::Pending => Ok(Outcome::Pending),
        Outcome::Ready(_) => Ok(Outcome::Ready(leaf_value())),
      }
    }
  }

  #[test]
  fn cycles_fail_instead_of_looping() {
    let mut engine = MemoEngine::new(Box::new(CycleFns));
    let mut reporter = CollectingReporter::default();
    let err = engine.evaluate(&key("x"), &mut reporter).unwrap_err();
    assert!(err.to_string().contains("cycle"));
  }
}
