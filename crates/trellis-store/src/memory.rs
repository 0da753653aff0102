//! In-memory store.
//!
//! A single mutex over the run map. `atomic_merge` validates and merges
//! entirely under the lock, so the indivisibility contract holds trivially;
//! the merge is pure CPU work and the lock is never held across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::transition::apply_merge;
use crate::types::{NodeState, Run, RunStatus};
use crate::{Error, Store};

/// In-process run storage for tests and single-node embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
  runs: Mutex<HashMap<String, Run>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_run(&self, run: &Run) -> Result<(), Error> {
    let mut runs = self.runs.lock().expect("run map lock poisoned");
    runs.insert(run.run_id.clone(), run.clone());
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<Run, Error> {
    let runs = self.runs.lock().expect("run map lock poisoned");
    runs
      .get(run_id)
      .cloned()
      .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
  }

  async fn atomic_merge(
    &self,
    run_id: &str,
    update: HashMap<String, NodeState>,
  ) -> Result<Run, Error> {
    let mut runs = self.runs.lock().expect("run map lock poisoned");
    let run = runs
      .get_mut(run_id)
      .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
    apply_merge(&mut run.node_states, update)?;
    Ok(run.clone())
  }

  async fn update_run_status(
    &self,
    run_id: &str,
    status: RunStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error> {
    let mut runs = self.runs.lock().expect("run map lock poisoned");
    let run = runs
      .get_mut(run_id)
      .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
    run.status = status;
    run.completed_at = completed_at;
    Ok(())
  }

  async fn list_runs(&self, graph_id: &str) -> Result<Vec<Run>, Error> {
    let runs = self.runs.lock().expect("run map lock poisoned");
    let mut matching: Vec<Run> = runs
      .values()
      .filter(|r| r.graph_id == graph_id)
      .cloned()
      .collect();
    matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(matching)
  }
}
