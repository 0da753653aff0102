//! Engine error types.
//!
//! The taxonomy mirrors how callers must react: validation errors are the
//! caller's fault and leave run state untouched; infrastructure errors mean
//! nothing was written; node execution failures are not errors at this
//! level at all — they are recorded into the failing node's state and
//! surface through `get_run`.

use trellis_store::NodeStatus;

/// A boundary call was rejected before any state was written.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
  /// The callback payload does not match the wire contract.
  #[error("malformed callback payload: {0}")]
  MalformedCallback(String),

  /// The node id does not exist in the run's graph or state.
  #[error("unknown node: {node_id}")]
  UnknownNode { node_id: String },

  /// A callback arrived for a node that was never dispatched, or that is
  /// not a worker.
  #[error("node '{node_id}' has no dispatched worker call")]
  UnexpectedCallback { node_id: String },

  /// Gate completion on a node that is not suspended.
  #[error("node '{node_id}' is not waiting for input")]
  NotWaitingForInput { node_id: String },

  /// Retry on a node that is not failed.
  #[error("node '{node_id}' is not failed")]
  NodeNotFailed { node_id: String },

  /// The requested status change is not in the legal transition table.
  #[error("illegal transition for node '{node_id}': {} -> {}", from.as_str(), to.as_str())]
  IllegalTransition {
    node_id: String,
    from: NodeStatus,
    to: NodeStatus,
  },
}

/// Errors surfaced by the engine's boundaries.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  /// The run references a graph version this engine has not published.
  #[error("unknown graph version: {0}")]
  UnknownGraph(String),

  /// The store itself failed; no partial state was written.
  #[error("store error: {0}")]
  Infrastructure(#[from] trellis_store::Error),
}
