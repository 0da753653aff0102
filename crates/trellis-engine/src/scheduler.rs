//! The edge-walking scheduler.
//!
//! Nothing here polls: downstream nodes fire only in response to upstream
//! completion events. `advance` is an explicit iterative work-list rather
//! than call-stack recursion, so deep graphs cannot blow the stack and a
//! cascade is inspectable mid-flight. Every drained id re-reads the run
//! from the store before evaluating downstream readiness — double-delivered
//! events and concurrent cascades resolve against persisted state, and the
//! store's transition validation is what prevents double-firing.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use trellis_graph::{ExecutionGraph, NodeKind, base_of, split_instance};
use trellis_store::{NodeState, NodeStatus, RunStatus};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::ExecutionNotifier;
use crate::fire::Fired;
use crate::input::merged_input;

impl<N: ExecutionNotifier> Engine<N> {
  /// Walk downstream from each completed node, firing everything that has
  /// become ready, until the cascade dries up.
  pub(crate) async fn advance(
    &self,
    graph: &ExecutionGraph,
    run_id: &str,
    seeds: Vec<String>,
  ) -> Result<(), EngineError> {
    let mut queue: VecDeque<String> = seeds.into();

    while let Some(done_id) = queue.pop_front() {
      let done_base = base_of(&done_id).to_string();

      for target_base in graph.downstream(&done_base) {
        let run = self.store.get_run(run_id).await?;
        let states = &run.node_states;

        let Some(node) = graph.node(target_base) else {
          continue;
        };

        if !upstream_satisfied(graph, states, target_base) {
          // Keep collector progress observable while it waits.
          if matches!(node.kind, NodeKind::Collector(_)) {
            self
              .refresh_collector_counters(graph, run_id, target_base, states)
              .await?;
          }
          debug!(run_id, node_id = %target_base, "downstream not ready");
          continue;
        }

        let targets = resolve_targets(states, target_base);
        if targets.is_empty() {
          // A fan-out that produced zero instances: nothing to fire, but
          // its downstream must still be evaluated as if it completed.
          if graph.is_parallel_target(target_base) {
            queue.push_back(target_base.clone());
          }
          continue;
        }

        for target in targets {
          let Some(state) = states.get(&target) else {
            continue;
          };
          if state.status != NodeStatus::Pending {
            continue;
          }

          let fired = match &node.kind {
            NodeKind::Collector(cfg) => {
              self
                .complete_collector(graph, run_id, &target, cfg, states)
                .await?
            }
            _ => {
              let input = match &state.input {
                Some(seeded) => seeded.clone(),
                None => merged_input(graph, states, target_base),
              };
              self.fire_node(graph, run_id, &target, input).await?
            }
          };

          if matches!(fired, Fired::Completed) {
            queue.push_back(target.clone());
          }
        }
      }
    }

    Ok(())
  }
}

/// Parallel instances of `base` present in the run, sorted by index.
pub(crate) fn instances_of(
  states: &HashMap<String, NodeState>,
  base: &str,
) -> Vec<(usize, String)> {
  let mut instances: Vec<(usize, String)> = states
    .keys()
    .filter_map(|id| match split_instance(id) {
      (b, Some(index)) if b == base => Some((index, id.clone())),
      _ => None,
    })
    .collect();
  instances.sort_unstable_by_key(|(index, _)| *index);
  instances
}

/// The concrete state keys a downstream base id resolves to: its parallel
/// instances when any exist, the static node otherwise. Empty when the base
/// is a fan-out target whose splitter produced no instances (yet).
pub(crate) fn resolve_targets(states: &HashMap<String, NodeState>, base: &str) -> Vec<String> {
  let instances = instances_of(states, base);
  if !instances.is_empty() {
    return instances.into_iter().map(|(_, id)| id).collect();
  }
  if states.contains_key(base) {
    vec![base.to_string()]
  } else {
    Vec::new()
  }
}

/// Whether every upstream dependency of `node_id` is satisfied.
///
/// Per upstream id: all parallel instances must be completed when any
/// exist; a fan-out target with no instances counts as satisfied only once
/// its feeding splitter completed (a legitimate empty fan-out); otherwise
/// the static node must be completed.
pub(crate) fn upstream_satisfied(
  graph: &ExecutionGraph,
  states: &HashMap<String, NodeState>,
  node_id: &str,
) -> bool {
  graph.upstream(node_id).iter().all(|upstream| {
    let instances = instances_of(states, upstream);
    if !instances.is_empty() {
      return instances
        .iter()
        .all(|(_, id)| states[id].status == NodeStatus::Completed);
    }
    if graph.is_parallel_target(upstream) {
      return graph
        .splitter_feeding(upstream)
        .and_then(|splitter| states.get(splitter))
        .is_some_and(|state| state.status == NodeStatus::Completed);
    }
    states
      .get(upstream)
      .is_some_and(|state| state.status == NodeStatus::Completed)
  })
}

/// Derive a run's status from its node states.
///
/// Running while anything is in flight or could still fire; otherwise
/// terminal, with failures downgrading the result. Pending nodes trapped
/// behind a failed ancestor are stable-until-retry and do not keep the run
/// alive.
pub fn run_status(graph: &ExecutionGraph, states: &HashMap<String, NodeState>) -> RunStatus {
  let mut any_failed = false;
  let mut any_completed = false;

  for state in states.values() {
    match state.status {
      NodeStatus::Running | NodeStatus::WaitingForInput => return RunStatus::Running,
      NodeStatus::Failed => any_failed = true,
      NodeStatus::Completed => any_completed = true,
      NodeStatus::Pending => {}
    }
  }

  let blocked = blocked_bases(graph, states);
  for (id, state) in states {
    if state.status == NodeStatus::Pending && !blocked.contains(base_of(id)) {
      return RunStatus::Running;
    }
  }

  if any_failed {
    if any_completed {
      RunStatus::CompletedWithErrors
    } else {
      RunStatus::Failed
    }
  } else {
    RunStatus::Succeeded
  }
}

/// Base ids transitively downstream of any failed node. Those branches are
/// halted until a retry succeeds.
fn blocked_bases(graph: &ExecutionGraph, states: &HashMap<String, NodeState>) -> HashSet<String> {
  let mut queue: VecDeque<String> = states
    .iter()
    .filter(|(_, state)| state.status == NodeStatus::Failed)
    .map(|(id, _)| base_of(id).to_string())
    .collect();

  let mut blocked = HashSet::new();
  while let Some(base) = queue.pop_front() {
    for downstream in graph.downstream(&base) {
      if blocked.insert(downstream.clone()) {
        queue.push_back(downstream.clone());
      }
    }
  }
  blocked
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use trellis_graph::{
    CollectorConfig, EdgeDef, GraphDef, NodeDef, SplitterConfig, WorkerConfig, compile,
  };

  fn worker(id: &str) -> NodeDef {
    NodeDef {
      id: id.to_string(),
      kind: NodeKind::Worker(WorkerConfig {
        endpoint: "https://workers.test/x".to_string(),
        config: serde_json::Value::Null,
        entity_move: None,
      }),
      label: None,
      position: None,
    }
  }

  fn edge(source: &str, target: &str) -> EdgeDef {
    EdgeDef {
      source: source.to_string(),
      target: target.to_string(),
      source_handle: None,
      target_handle: None,
      mapping: None,
    }
  }

  fn fan_graph() -> ExecutionGraph {
    // split -> work (fan-out) -> gather
    let def = GraphDef {
      graph_id: "g".to_string(),
      version: 1,
      name: "g".to_string(),
      nodes: vec![
        NodeDef {
          id: "split".to_string(),
          kind: NodeKind::Splitter(SplitterConfig {
            items_path: "items".to_string(),
            fan_out: None,
          }),
          label: None,
          position: None,
        },
        worker("work"),
        NodeDef {
          id: "gather".to_string(),
          kind: NodeKind::Collector(CollectorConfig::default()),
          label: None,
          position: None,
        },
      ],
      edges: vec![edge("split", "work"), edge("work", "gather")],
    };
    compile(&def).unwrap()
  }

  #[test]
  fn instances_sort_by_index_not_arrival() {
    let states = HashMap::from([
      ("work_10".to_string(), NodeState::pending()),
      ("work_2".to_string(), NodeState::pending()),
      ("work_0".to_string(), NodeState::pending()),
      ("other_1".to_string(), NodeState::pending()),
    ]);
    let instances = instances_of(&states, "work");
    let ids: Vec<&str> = instances.iter().map(|(_, id)| id.as_str()).collect();
    assert_eq!(ids, ["work_0", "work_2", "work_10"]);
  }

  #[test]
  fn readiness_requires_all_instances_completed() {
    let graph = fan_graph();
    let mut states = HashMap::from([
      (
        "split".to_string(),
        NodeState::completed(None, json!({"items": ["a", "b"]})),
      ),
      (
        "work_0".to_string(),
        NodeState::completed(None, json!({"r": 1})),
      ),
      ("work_1".to_string(), NodeState::running(json!("b"))),
      ("gather".to_string(), NodeState::pending()),
    ]);
    assert!(!upstream_satisfied(&graph, &states, "gather"));

    states.insert(
      "work_1".to_string(),
      NodeState::completed(None, json!({"r": 2})),
    );
    assert!(upstream_satisfied(&graph, &states, "gather"));
  }

  #[test]
  fn empty_fan_out_is_satisfied_once_splitter_completed() {
    let graph = fan_graph();
    let mut states = HashMap::from([
      ("split".to_string(), NodeState::running(json!({}))),
      ("gather".to_string(), NodeState::pending()),
    ]);
    // Splitter still running: the fan-out branch is still coming.
    assert!(!upstream_satisfied(&graph, &states, "gather"));

    states.insert(
      "split".to_string(),
      NodeState::completed(None, json!({"items": []})),
    );
    assert!(upstream_satisfied(&graph, &states, "gather"));
  }

  #[test]
  fn run_status_reflects_blocked_branches() {
    let def = GraphDef {
      graph_id: "g".to_string(),
      version: 1,
      name: "g".to_string(),
      nodes: vec![worker("a"), worker("b"), worker("c")],
      edges: vec![edge("a", "b"), edge("b", "c")],
    };
    let graph = compile(&def).unwrap();

    let mut states = HashMap::from([
      (
        "a".to_string(),
        NodeState::completed(None, json!({"ok": true})),
      ),
      ("b".to_string(), NodeState::failed(None, "timeout")),
      ("c".to_string(), NodeState::pending()),
    ]);
    // c is pending but trapped behind the failure: terminal with errors.
    assert_eq!(run_status(&graph, &states), RunStatus::CompletedWithErrors);

    // Retry resets b: the branch is live again.
    states.insert("b".to_string(), NodeState::pending());
    assert_eq!(run_status(&graph, &states), RunStatus::Running);
  }

  #[test]
  fn run_status_terminal_shapes() {
    let def = GraphDef {
      graph_id: "g".to_string(),
      version: 1,
      name: "g".to_string(),
      nodes: vec![worker("a")],
      edges: vec![],
    };
    let graph = compile(&def).unwrap();

    let states = HashMap::from([(
      "a".to_string(),
      NodeState::completed(None, json!({})),
    )]);
    assert_eq!(run_status(&graph, &states), RunStatus::Succeeded);

    let states = HashMap::from([("a".to_string(), NodeState::failed(None, "boom"))]);
    assert_eq!(run_status(&graph, &states), RunStatus::Failed);

    let states = HashMap::from([("a".to_string(), NodeState::running(json!({})))]);
    assert_eq!(run_status(&graph, &states), RunStatus::Running);
  }
}
