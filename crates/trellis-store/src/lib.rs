//! Trellis Store
//!
//! Run state persistence for the execution engine. A run's `node_states`
//! map is the only concurrency-exposed mutable state in the system, and
//! [`Store::atomic_merge`] is the only way to mutate it: a single
//! indivisible read-merge-write that replaces exactly the supplied keys and
//! validates every status change against the legal transition table.
//!
//! Two implementations:
//! - [`MemoryStore`] — in-process, mutex-guarded; tests and single-node
//!   embedding.
//! - [`SqliteStore`] — durable, backed by SQLite via `sqlx`; the merge runs
//!   inside one immediate write transaction.
//!
//! Reads via [`Store::get_run`] are non-atomic snapshots for polling and
//! display. They must never feed a write; writers go back through
//! `atomic_merge`.

mod memory;
mod sqlite;
mod transition;
mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use transition::{apply_merge, transition_allowed};
pub use types::{NodeState, NodeStatus, Run, RunStatus, TriggerMeta};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested run was not found.
  #[error("run not found: {0}")]
  RunNotFound(String),

  /// A merge tried to move a node through an illegal status transition.
  #[error("illegal transition for node '{node_id}': {} -> {}", from.as_str(), to.as_str())]
  IllegalTransition {
    node_id: String,
    from: NodeStatus,
    to: NodeStatus,
  },

  /// A merge supplied a structurally invalid node state.
  #[error("invalid state for node '{node_id}': {message}")]
  InvalidState { node_id: String, message: String },

  /// A persisted record failed to decode.
  #[error("corrupt run record: {0}")]
  Corrupt(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for runs.
#[async_trait]
pub trait Store: Send + Sync {
  /// Persist a freshly created run.
  async fn create_run(&self, run: &Run) -> Result<(), Error>;

  /// Snapshot a run. Safe for polling; never the basis of a write.
  async fn get_run(&self, run_id: &str) -> Result<Run, Error>;

  /// Atomically merge `update` into the run's node states.
  ///
  /// The entire read-validate-merge-write happens as one indivisible
  /// operation: concurrent merges to disjoint keys both survive, and no
  /// caller can observe (or overwrite) a half-applied batch. Returns the
  /// run as it stands after the merge.
  async fn atomic_merge(
    &self,
    run_id: &str,
    update: HashMap<String, NodeState>,
  ) -> Result<Run, Error>;

  /// Record the run's derived status.
  async fn update_run_status(
    &self,
    run_id: &str,
    status: RunStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error>;

  /// List runs for one graph, newest first.
  async fn list_runs(&self, graph_id: &str) -> Result<Vec<Run>, Error>;
}
