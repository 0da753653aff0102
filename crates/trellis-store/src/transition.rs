//! The legal node-status transition table, and the merge that enforces it.
//!
//! Once a node is `completed` or `failed` its status never moves again,
//! except `failed -> pending` through an explicit retry. `pending ->
//! pending` is the one legal same-status merge: collectors refresh their
//! progress counters that way. Every other same-status merge is rejected,
//! which is exactly what makes the store the guard against double-firing.

use std::collections::HashMap;

use crate::Error;
use crate::types::{NodeState, NodeStatus};

/// Whether `from -> to` is a legal status transition.
pub fn transition_allowed(from: NodeStatus, to: NodeStatus) -> bool {
  use NodeStatus::*;
  matches!(
    (from, to),
    (Pending, Pending)
      | (Pending, Running)
      | (Pending, Completed)
      | (Pending, Failed)
      | (Pending, WaitingForInput)
      | (Running, Completed)
      | (Running, Failed)
      | (WaitingForInput, Completed)
      | (Failed, Pending)
  )
}

/// Merge `update` into `current` key by key.
///
/// Validates every supplied key first, then replaces exactly the supplied
/// keys; all other keys are preserved verbatim. Nothing is written when any
/// key fails validation. First writes of previously unknown keys (parallel
/// instances being seeded) are always legal.
pub fn apply_merge(
  current: &mut HashMap<String, NodeState>,
  update: HashMap<String, NodeState>,
) -> Result<(), Error> {
  for (node_id, state) in &update {
    if state.output.is_some() && state.error.is_some() {
      return Err(Error::InvalidState {
        node_id: node_id.clone(),
        message: "output and error are mutually exclusive".to_string(),
      });
    }
    if let Some(existing) = current.get(node_id) {
      if !transition_allowed(existing.status, state.status) {
        return Err(Error::IllegalTransition {
          node_id: node_id.clone(),
          from: existing.status,
          to: state.status,
        });
      }
    }
  }
  current.extend(update);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn lifecycle_transitions_are_legal() {
    use NodeStatus::*;
    assert!(transition_allowed(Pending, Running));
    assert!(transition_allowed(Running, Completed));
    assert!(transition_allowed(Running, Failed));
    assert!(transition_allowed(Pending, WaitingForInput));
    assert!(transition_allowed(WaitingForInput, Completed));
    assert!(transition_allowed(Failed, Pending));
    assert!(transition_allowed(Pending, Completed));
  }

  #[test]
  fn terminal_states_never_move() {
    use NodeStatus::*;
    for to in [Pending, Running, Completed, Failed, WaitingForInput] {
      assert!(!transition_allowed(Completed, to));
    }
    assert!(!transition_allowed(Failed, Running));
    assert!(!transition_allowed(Failed, Completed));
  }

  #[test]
  fn refire_shaped_transitions_are_illegal() {
    use NodeStatus::*;
    assert!(!transition_allowed(Running, Running));
    assert!(!transition_allowed(Running, WaitingForInput));
    assert!(!transition_allowed(WaitingForInput, WaitingForInput));
    assert!(!transition_allowed(WaitingForInput, Failed));
  }

  #[test]
  fn merge_replaces_only_supplied_keys() {
    let mut current = HashMap::from([
      ("a".to_string(), NodeState::pending()),
      ("b".to_string(), NodeState::pending()),
    ]);
    let update = HashMap::from([("a".to_string(), NodeState::running(json!({})))]);

    apply_merge(&mut current, update).unwrap();
    assert_eq!(current["a"].status, NodeStatus::Running);
    assert_eq!(current["b"], NodeState::pending());
  }

  #[test]
  fn merge_rejects_illegal_transition_without_writing() {
    let mut current = HashMap::from([
      ("a".to_string(), NodeState::completed(None, json!({"r": 1}))),
      ("b".to_string(), NodeState::pending()),
    ]);
    let update = HashMap::from([
      ("b".to_string(), NodeState::running(json!({}))),
      ("a".to_string(), NodeState::running(json!({}))),
    ]);

    let err = apply_merge(&mut current, update).unwrap_err();
    assert!(matches!(err, Error::IllegalTransition { .. }));
    // The legal half of the batch must not have been applied either.
    assert_eq!(current["b"], NodeState::pending());
  }

  #[test]
  fn merge_accepts_first_write_of_new_keys() {
    let mut current = HashMap::new();
    let update = HashMap::from([(
      "work_0".to_string(),
      NodeState::pending_with_input(json!("x")),
    )]);
    apply_merge(&mut current, update).unwrap();
    assert_eq!(current["work_0"].input, Some(json!("x")));
  }

  #[test]
  fn merge_rejects_output_error_conflict() {
    let mut current = HashMap::new();
    let state = NodeState {
      error: Some("boom".to_string()),
      ..NodeState::completed(None, json!({}))
    };
    let err = apply_merge(&mut current, HashMap::from([("a".to_string(), state)])).unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
  }
}
