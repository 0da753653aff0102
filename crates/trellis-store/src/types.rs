use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a whole run, derived from its node states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  /// Something can still happen: a node is running, a gate is waiting, or
  /// an unblocked pending node exists.
  Running,
  /// Every node completed.
  Succeeded,
  /// Terminal with failures and nothing completed at all.
  Failed,
  /// Terminal with at least one failed branch and at least one completed
  /// node. Sibling branches of a failure are allowed to finish.
  CompletedWithErrors,
}

impl RunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunStatus::Running => "running",
      RunStatus::Succeeded => "succeeded",
      RunStatus::Failed => "failed",
      RunStatus::CompletedWithErrors => "completed_with_errors",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "running" => Some(RunStatus::Running),
      "succeeded" => Some(RunStatus::Succeeded),
      "failed" => Some(RunStatus::Failed),
      "completed_with_errors" => Some(RunStatus::CompletedWithErrors),
      _ => None,
    }
  }

  /// Whether the run has reached a stable end state.
  pub fn is_terminal(&self) -> bool {
    !matches!(self, RunStatus::Running)
  }
}

/// Status of one node (or parallel instance) within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
  Pending,
  Running,
  Completed,
  Failed,
  WaitingForInput,
}

impl NodeStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      NodeStatus::Pending => "pending",
      NodeStatus::Running => "running",
      NodeStatus::Completed => "completed",
      NodeStatus::Failed => "failed",
      NodeStatus::WaitingForInput => "waiting_for_input",
    }
  }
}

/// The persisted state of one node (or parallel instance).
///
/// `input` is written once, when the node is claimed or seeded, and never
/// rewritten afterwards; the worker pass-through merge and duplicate-callback
/// handling both rely on that. `output` and `error` are mutually exclusive.
/// The `upstream_*` fields are collector bookkeeping and stay `None` for
/// every other node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
  pub status: NodeStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub input: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upstream_completed_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expected_upstream_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upstream_outputs: Option<BTreeMap<String, serde_json::Value>>,
}

impl NodeState {
  pub fn pending() -> Self {
    Self {
      status: NodeStatus::Pending,
      input: None,
      output: None,
      error: None,
      upstream_completed_count: None,
      expected_upstream_count: None,
      upstream_outputs: None,
    }
  }

  pub fn pending_with_input(input: serde_json::Value) -> Self {
    Self {
      input: Some(input),
      ..Self::pending()
    }
  }

  pub fn running(input: serde_json::Value) -> Self {
    Self {
      status: NodeStatus::Running,
      input: Some(input),
      ..Self::pending()
    }
  }

  pub fn waiting_for_input(input: serde_json::Value) -> Self {
    Self {
      status: NodeStatus::WaitingForInput,
      input: Some(input),
      ..Self::pending()
    }
  }

  pub fn completed(input: Option<serde_json::Value>, output: serde_json::Value) -> Self {
    Self {
      status: NodeStatus::Completed,
      input,
      output: Some(output),
      ..Self::pending()
    }
  }

  pub fn failed(input: Option<serde_json::Value>, error: impl Into<String>) -> Self {
    Self {
      status: NodeStatus::Failed,
      input,
      error: Some(error.into()),
      ..Self::pending()
    }
  }
}

/// Where a run came from. Passive provenance, only ever propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerMeta {
  Manual {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor: Option<String>,
  },
  Webhook {
    source: String,
  },
  Schedule {
    schedule_id: String,
  },
}

/// One execution instance of a compiled workflow graph.
///
/// `node_states` is keyed by node id or parallel-instance id and is only
/// ever mutated through [`crate::Store::atomic_merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
  pub run_id: String,
  pub graph_id: String,
  pub graph_version: u32,
  pub status: RunStatus,
  pub trigger: TriggerMeta,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entity_ref: Option<String>,
  pub node_states: HashMap<String, NodeState>,
  pub started_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
}
