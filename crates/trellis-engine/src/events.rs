//! Execution events and notifiers for observability.
//!
//! Events are emitted as runs advance so consumers can observe progress —
//! stream to the canvas UI, persist an audit trail, feed dashboards —
//! without polling `get_run`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use trellis_store::RunStatus;

/// Events emitted while a run advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A run was created and its entry nodes fired.
  RunStarted { run_id: String, graph_ref: String },

  /// A node was claimed and its work dispatched.
  NodeFired { run_id: String, node_id: String },

  /// A node completed with the given output.
  NodeCompleted {
    run_id: String,
    node_id: String,
    output: serde_json::Value,
  },

  /// A node failed; its branch is halted until an operator retries.
  NodeFailed {
    run_id: String,
    node_id: String,
    error: String,
  },

  /// A gate suspended its branch pending user input.
  GateWaiting { run_id: String, node_id: String },

  /// An operator reset a failed node back to pending.
  NodeRetried { run_id: String, node_id: String },

  /// The run reached a stable end state.
  RunFinished { run_id: String, status: RunStatus },
}

/// Trait for receiving execution events.
///
/// The engine calls `notify` for each event; implementations decide what to
/// do with them (broadcast, persist, log, ignore).
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {
    // Intentionally empty
  }
}

/// A notifier that sends events to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls a callback cascade; event
/// volume is a handful per node, so growth is not a practical concern.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
