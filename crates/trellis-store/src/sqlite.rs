//! SQLite-backed store.
//!
//! Runs live in one table with `node_states` as a JSON column. The merge
//! primitive takes an immediate write transaction before reading, so the
//! read-validate-merge-write sequence is serialized against every other
//! writer; concurrent callers queue on SQLite's write lock (bounded by the
//! configured busy timeout) instead of overwriting each other.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::transition::apply_merge;
use crate::types::{NodeState, Run, RunStatus, TriggerMeta};
use crate::{Error, Store};

const SCHEMA: [&str; 2] = [
  "CREATE TABLE IF NOT EXISTS runs (
    run_id        TEXT PRIMARY KEY,
    graph_id      TEXT NOT NULL,
    graph_version INTEGER NOT NULL,
    status        TEXT NOT NULL,
    trigger_meta  TEXT NOT NULL,
    entity_ref    TEXT,
    node_states   TEXT NOT NULL,
    started_at    TEXT NOT NULL,
    completed_at  TEXT
  )",
  "CREATE INDEX IF NOT EXISTS idx_runs_graph ON runs (graph_id, started_at)",
];

/// Durable run storage backed by SQLite.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Open (and create if missing) the database at `url`, e.g.
  /// `sqlite:///home/me/.trellis/runs.db`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(5)
      .connect_with(options)
      .await?;

    for statement in SCHEMA {
      sqlx::query(statement).execute(&pool).await?;
    }

    Ok(Self { pool })
  }
}

#[derive(sqlx::FromRow)]
struct RunRow {
  run_id: String,
  graph_id: String,
  graph_version: i64,
  status: String,
  trigger_meta: String,
  entity_ref: Option<String>,
  node_states: String,
  started_at: DateTime<Utc>,
  completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
  fn into_run(self) -> Result<Run, Error> {
    let status = RunStatus::parse(&self.status)
      .ok_or_else(|| Error::Corrupt(format!("unknown run status '{}'", self.status)))?;
    let trigger: TriggerMeta = serde_json::from_str(&self.trigger_meta)
      .map_err(|e| Error::Corrupt(format!("trigger metadata: {e}")))?;
    let node_states: HashMap<String, NodeState> = serde_json::from_str(&self.node_states)
      .map_err(|e| Error::Corrupt(format!("node states: {e}")))?;

    Ok(Run {
      run_id: self.run_id,
      graph_id: self.graph_id,
      graph_version: self.graph_version as u32,
      status,
      trigger,
      entity_ref: self.entity_ref,
      node_states,
      started_at: self.started_at,
      completed_at: self.completed_at,
    })
  }
}

fn encode_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, Error> {
  serde_json::to_string(value).map_err(|e| Error::Corrupt(format!("{what}: {e}")))
}

const SELECT_RUN: &str = "SELECT run_id, graph_id, graph_version, status, trigger_meta, \
                          entity_ref, node_states, started_at, completed_at FROM runs";

#[async_trait]
impl Store for SqliteStore {
  async fn create_run(&self, run: &Run) -> Result<(), Error> {
    sqlx::query(
      "INSERT INTO runs (run_id, graph_id, graph_version, status, trigger_meta, entity_ref, \
       node_states, started_at, completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(&run.run_id)
    .bind(&run.graph_id)
    .bind(run.graph_version as i64)
    .bind(run.status.as_str())
    .bind(encode_json(&run.trigger, "trigger metadata")?)
    .bind(&run.entity_ref)
    .bind(encode_json(&run.node_states, "node states")?)
    .bind(run.started_at)
    .bind(run.completed_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<Run, Error> {
    let row: Option<RunRow> = sqlx::query_as(&format!("{SELECT_RUN} WHERE run_id = ?1"))
      .bind(run_id)
      .fetch_optional(&self.pool)
      .await?;
    row
      .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?
      .into_run()
  }

  async fn atomic_merge(
    &self,
    run_id: &str,
    update: HashMap<String, NodeState>,
  ) -> Result<Run, Error> {
    let mut conn = self.pool.acquire().await?;

    // Immediate transaction: the write lock is taken before the read below,
    // so no other writer can slip a merge in between our read and write.
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let result: Result<Run, Error> = async {
      let row: Option<RunRow> = sqlx::query_as(&format!("{SELECT_RUN} WHERE run_id = ?1"))
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?;
      let mut run = row
        .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?
        .into_run()?;

      apply_merge(&mut run.node_states, update)?;

      sqlx::query("UPDATE runs SET node_states = ?2 WHERE run_id = ?1")
        .bind(run_id)
        .bind(encode_json(&run.node_states, "node states")?)
        .execute(&mut *conn)
        .await?;

      Ok(run)
    }
    .await;

    match result {
      Ok(run) => {
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(run)
      }
      Err(err) => {
        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        Err(err)
      }
    }
  }

  async fn update_run_status(
    &self,
    run_id: &str,
    status: RunStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error> {
    let updated = sqlx::query("UPDATE runs SET status = ?2, completed_at = ?3 WHERE run_id = ?1")
      .bind(run_id)
      .bind(status.as_str())
      .bind(completed_at)
      .execute(&self.pool)
      .await?;
    if updated.rows_affected() == 0 {
      return Err(Error::RunNotFound(run_id.to_string()));
    }
    Ok(())
  }

  async fn list_runs(&self, graph_id: &str) -> Result<Vec<Run>, Error> {
    let rows: Vec<RunRow> =
      sqlx::query_as(&format!("{SELECT_RUN} WHERE graph_id = ?1 ORDER BY started_at DESC"))
        .bind(graph_id)
        .fetch_all(&self.pool)
        .await?;
    rows.into_iter().map(RunRow::into_run).collect()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::types::NodeStatus;

  async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("runs.db").display());
    let store = SqliteStore::connect(&url).await.expect("connect");
    (store, dir)
  }

  fn test_run(run_id: &str) -> Run {
    Run {
      run_id: run_id.to_string(),
      graph_id: "pipeline".to_string(),
      graph_version: 2,
      status: RunStatus::Running,
      trigger: TriggerMeta::Webhook {
        source: "stripe".to_string(),
      },
      entity_ref: Some("lead-77".to_string()),
      node_states: HashMap::from([("a".to_string(), NodeState::pending())]),
      started_at: Utc::now(),
      completed_at: None,
    }
  }

  #[tokio::test]
  async fn create_and_get_round_trip() {
    let (store, _dir) = temp_store().await;
    let run = test_run("r1");
    store.create_run(&run).await.unwrap();

    let loaded = store.get_run("r1").await.unwrap();
    assert_eq!(loaded.graph_id, "pipeline");
    assert_eq!(loaded.graph_version, 2);
    assert_eq!(loaded.entity_ref.as_deref(), Some("lead-77"));
    assert_eq!(loaded.node_states["a"].status, NodeStatus::Pending);
    assert!(matches!(loaded.trigger, TriggerMeta::Webhook { .. }));
  }

  #[tokio::test]
  async fn merge_is_per_key_and_validated() {
    let (store, _dir) = temp_store().await;
    let mut run = test_run("r1");
    run
      .node_states
      .insert("b".to_string(), NodeState::pending());
    store.create_run(&run).await.unwrap();

    let merged = store
      .atomic_merge(
        "r1",
        HashMap::from([("a".to_string(), NodeState::running(json!({"n": 1})))]),
      )
      .await
      .unwrap();
    assert_eq!(merged.node_states["a"].status, NodeStatus::Running);
    assert_eq!(merged.node_states["b"].status, NodeStatus::Pending);

    let err = store
      .atomic_merge(
        "r1",
        HashMap::from([("a".to_string(), NodeState::pending())]),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, Error::IllegalTransition { .. }));

    // The rejected merge must not have written anything.
    let run = store.get_run("r1").await.unwrap();
    assert_eq!(run.node_states["a"].status, NodeStatus::Running);
  }

  #[tokio::test]
  async fn status_update_and_listing() {
    let (store, _dir) = temp_store().await;
    store.create_run(&test_run("r1")).await.unwrap();

    let finished = Utc::now();
    store
      .update_run_status("r1", RunStatus::Succeeded, Some(finished))
      .await
      .unwrap();

    let runs = store.list_runs("pipeline").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Succeeded);
    assert!(runs[0].completed_at.is_some());

    let err = store
      .update_run_status("missing", RunStatus::Succeeded, None)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::RunNotFound(_)));
  }
}
