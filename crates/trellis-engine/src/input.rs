//! Input assembly for downstream nodes.
//!
//! When a node becomes ready, its input is built from its upstream outputs:
//! each incoming edge either applies its configured field mapping or falls
//! back to an unkeyed shallow merge of object outputs. The merge is
//! last-writer-wins across same-named keys, in upstream-edge order then
//! instance-index order — the relaxed pass-through policy the product has
//! always had, kept deterministic by never depending on callback arrival
//! order.

use std::collections::HashMap;

use serde_json::{Map, Value};

use trellis_graph::ExecutionGraph;
use trellis_store::{NodeState, NodeStatus};

use crate::scheduler::instances_of;

/// Build the merged input for `node_id` from its completed upstream outputs.
pub(crate) fn merged_input(
  graph: &ExecutionGraph,
  states: &HashMap<String, NodeState>,
  node_id: &str,
) -> Value {
  let mut acc = Map::new();
  for upstream in graph.upstream(node_id) {
    let mapping = graph.mapping(upstream, node_id);
    for output in upstream_contributions(states, upstream) {
      match mapping {
        Some(mapping) => mapping.apply(&output, &mut acc),
        None => shallow_merge(&mut acc, &output),
      }
    }
  }
  Value::Object(acc)
}

/// Completed outputs contributed by one upstream id: its parallel instances
/// in index order when they exist, the static node otherwise.
fn upstream_contributions(states: &HashMap<String, NodeState>, upstream: &str) -> Vec<Value> {
  let instances = instances_of(states, upstream);
  let ids: Vec<&str> = if instances.is_empty() {
    vec![upstream]
  } else {
    instances.iter().map(|(_, id)| id.as_str()).collect()
  };

  ids
    .into_iter()
    .filter_map(|id| states.get(id))
    .filter(|state| state.status == NodeStatus::Completed)
    .filter_map(|state| state.output.clone())
    .collect()
}

/// Merge an object output into the accumulator, last writer wins.
/// Non-object outputs only flow through explicit field mappings.
pub(crate) fn shallow_merge(acc: &mut Map<String, Value>, output: &Value) {
  if let Value::Object(fields) = output {
    for (key, value) in fields {
      acc.insert(key.clone(), value.clone());
    }
  }
}

/// Worker pass-through: the reported output is laid over the node's stored
/// input, worker keys winning, so upstream context survives the hop.
pub(crate) fn pass_through(input: Option<&Value>, output: Map<String, Value>) -> Value {
  match input {
    Some(Value::Object(input_fields)) => {
      let mut merged = input_fields.clone();
      merged.extend(output);
      Value::Object(merged)
    }
    _ => Value::Object(output),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn pass_through_lays_output_over_object_input() {
    let input = json!({"lead": "l1", "score": 1});
    let output = json!({"score": 2, "verdict": "hot"});
    let Value::Object(output) = output else {
      unreachable!()
    };

    let merged = pass_through(Some(&input), output);
    assert_eq!(merged, json!({"lead": "l1", "score": 2, "verdict": "hot"}));
  }

  #[test]
  fn pass_through_ignores_non_object_input() {
    let output = json!({"r": 1});
    let Value::Object(output) = output else {
      unreachable!()
    };
    let merged = pass_through(Some(&json!("element")), output);
    assert_eq!(merged, json!({"r": 1}));
  }

  #[test]
  fn shallow_merge_is_last_writer_wins() {
    let mut acc = Map::new();
    shallow_merge(&mut acc, &json!({"a": 1, "b": 1}));
    shallow_merge(&mut acc, &json!({"b": 2}));
    shallow_merge(&mut acc, &json!("not an object"));
    assert_eq!(Value::Object(acc), json!({"a": 1, "b": 2}));
  }
}
