//! The engine facade.
//!
//! `Engine` owns the published graph registry and exposes the boundaries
//! the rest of the platform calls into: run creation, the worker callback
//! endpoint, gate completion, operator retry, and the status query. Each
//! call validates at the boundary, mutates run state only through the
//! store's atomic merge, and runs its scheduler cascade to completion
//! before returning.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use trellis_dispatch::WorkerDispatcher;
use trellis_graph::{ExecutionGraph, NodeKind, WorkerConfig, base_of, version_ref};
use trellis_store::{
  Error as StoreError, NodeState, NodeStatus, Run, RunStatus, Store, TriggerMeta,
};

use crate::callback::CallbackPayload;
use crate::entity::{EntityMove, EntityMover, NoopMover};
use crate::error::{EngineError, ValidationError};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::fire::Fired;
use crate::input::pass_through;
use crate::scheduler::{run_status, upstream_satisfied};

/// The workflow execution engine.
///
/// Generic over `N: ExecutionNotifier` to allow different observation
/// strategies; `Engine::new` gives a no-op notifier.
pub struct Engine<N: ExecutionNotifier = NoopNotifier> {
  pub(crate) store: Arc<dyn Store>,
  pub(crate) dispatcher: Arc<dyn WorkerDispatcher>,
  pub(crate) entity_mover: Arc<dyn EntityMover>,
  pub(crate) notifier: N,
  /// Published graph versions. Read-mostly; the lock is never held across
  /// an await.
  graphs: RwLock<HashMap<String, Arc<ExecutionGraph>>>,
}

impl Engine<NoopNotifier> {
  /// Create an engine that discards execution events.
  pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn WorkerDispatcher>) -> Self {
    Self::with_notifier(store, dispatcher, NoopNotifier)
  }
}

impl<N: ExecutionNotifier> Engine<N> {
  /// Create an engine with a custom notifier.
  pub fn with_notifier(
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    notifier: N,
  ) -> Self {
    Self {
      store,
      dispatcher,
      entity_mover: Arc::new(NoopMover),
      notifier,
      graphs: RwLock::new(HashMap::new()),
    }
  }

  /// Wire up the entity tracking collaborator.
  pub fn with_entity_mover(mut self, mover: Arc<dyn EntityMover>) -> Self {
    self.entity_mover = mover;
    self
  }

  /// Publish a compiled graph version. Runs reference the returned version
  /// ref and stay frozen against it even while newer versions are edited
  /// and published.
  pub fn register_graph(&self, graph: ExecutionGraph) -> String {
    let graph_ref = graph.version_ref();
    self
      .graphs
      .write()
      .expect("graph registry lock poisoned")
      .insert(graph_ref.clone(), Arc::new(graph));
    info!(graph_ref = %graph_ref, "graph version published");
    graph_ref
  }

  fn graph_for(&self, graph_ref: &str) -> Result<Arc<ExecutionGraph>, EngineError> {
    self
      .graphs
      .read()
      .expect("graph registry lock poisoned")
      .get(graph_ref)
      .cloned()
      .ok_or_else(|| EngineError::UnknownGraph(graph_ref.to_string()))
  }

  fn graph_for_run(&self, run: &Run) -> Result<Arc<ExecutionGraph>, EngineError> {
    self.graph_for(&version_ref(&run.graph_id, run.graph_version))
  }

  /// Create a run frozen against a published graph version and fire its
  /// entry nodes with the initial input.
  #[instrument(skip(self, initial_input, trigger), fields(graph_ref = %graph_ref))]
  pub async fn start_run(
    &self,
    graph_ref: &str,
    initial_input: Value,
    entity_ref: Option<String>,
    trigger: TriggerMeta,
  ) -> Result<String, EngineError> {
    let graph = self.graph_for(graph_ref)?;
    let run_id = Uuid::new_v4().to_string();

    // Fan-out targets materialize as parallel instances when their
    // splitter fires; everything else starts pending.
    let node_states: HashMap<String, NodeState> = graph
      .node_ids()
      .filter(|id| !graph.is_parallel_target(id))
      .map(|id| (id.to_string(), NodeState::pending()))
      .collect();

    let run = Run {
      run_id: run_id.clone(),
      graph_id: graph.graph_id().to_string(),
      graph_version: graph.version(),
      status: RunStatus::Running,
      trigger,
      entity_ref,
      node_states,
      started_at: Utc::now(),
      completed_at: None,
    };
    self.store.create_run(&run).await?;

    info!(run_id = %run_id, "run started");
    self.notifier.notify(ExecutionEvent::RunStarted {
      run_id: run_id.clone(),
      graph_ref: graph_ref.to_string(),
    });

    let mut seeds = Vec::new();
    for entry in graph.entry_nodes() {
      let fired = self
        .fire_node(&graph, &run_id, entry, initial_input.clone())
        .await?;
      if fired == Fired::Completed {
        seeds.push(entry.clone());
      }
    }
    if !seeds.is_empty() {
      self.advance(&graph, &run_id, seeds).await?;
    }

    self.refresh_run_status(&graph, &run_id).await?;
    Ok(run_id)
  }

  /// The inbound worker callback boundary.
  ///
  /// Validates the payload shape before touching any state, records the
  /// outcome, and cascades on success. Duplicate deliveries of the same
  /// outcome are acknowledged as no-ops; the callback is acknowledged once
  /// validated regardless of whether it reported success or failure.
  #[instrument(skip(self, payload), fields(run_id = %run_id, node_id = %node_id))]
  pub async fn worker_callback(
    &self,
    run_id: &str,
    node_id: &str,
    payload: Value,
  ) -> Result<(), EngineError> {
    let payload = CallbackPayload::parse(&payload)?;

    let run = self.store.get_run(run_id).await?;
    let graph = self.graph_for_run(&run)?;

    let node = graph
      .node(base_of(node_id))
      .ok_or_else(|| ValidationError::UnknownNode {
        node_id: node_id.to_string(),
      })?;
    let NodeKind::Worker(cfg) = &node.kind else {
      return Err(
        ValidationError::UnexpectedCallback {
          node_id: node_id.to_string(),
        }
        .into(),
      );
    };
    let state = run
      .node_states
      .get(node_id)
      .ok_or_else(|| ValidationError::UnknownNode {
        node_id: node_id.to_string(),
      })?;

    // A genuine callback can only follow a dispatch, and a dispatch only
    // follows the pending -> running claim. Pending here means nobody
    // dispatched this node: a stray or forged callback.
    if state.status == NodeStatus::Pending {
      return Err(
        ValidationError::UnexpectedCallback {
          node_id: node_id.to_string(),
        }
        .into(),
      );
    }

    match payload {
      CallbackPayload::Completed { output } => {
        let output = pass_through(state.input.as_ref(), output);
        let completed = NodeState::completed(state.input.clone(), output.clone());
        match self
          .store
          .atomic_merge(run_id, HashMap::from([(node_id.to_string(), completed)]))
          .await
        {
          Ok(_) => {}
          Err(StoreError::IllegalTransition {
            from: NodeStatus::Completed,
            to: NodeStatus::Completed,
            ..
          }) => {
            // At-least-once delivery: same outcome again is a no-op, and
            // no downstream node re-fires because nothing changed.
            info!("duplicate completion callback ignored");
            return Ok(());
          }
          Err(StoreError::IllegalTransition { node_id, from, to }) => {
            return Err(ValidationError::IllegalTransition { node_id, from, to }.into());
          }
          Err(err) => return Err(err.into()),
        }

        info!("worker completed");
        self.notifier.notify(ExecutionEvent::NodeCompleted {
          run_id: run_id.to_string(),
          node_id: node_id.to_string(),
          output,
        });
        self.relocate_entity(&run, cfg, "completed").await;
        self
          .advance(&graph, run_id, vec![node_id.to_string()])
          .await?;
      }

      CallbackPayload::Failed { error } => {
        let failed = NodeState::failed(state.input.clone(), error.clone());
        match self
          .store
          .atomic_merge(run_id, HashMap::from([(node_id.to_string(), failed)]))
          .await
        {
          Ok(_) => {}
          Err(StoreError::IllegalTransition {
            from: NodeStatus::Failed,
            to: NodeStatus::Failed,
            ..
          }) => {
            info!("duplicate failure callback ignored");
            return Ok(());
          }
          Err(StoreError::IllegalTransition { node_id, from, to }) => {
            return Err(ValidationError::IllegalTransition { node_id, from, to }.into());
          }
          Err(err) => return Err(err.into()),
        }

        warn!(error = %error, "worker failed");
        self.notifier.notify(ExecutionEvent::NodeFailed {
          run_id: run_id.to_string(),
          node_id: node_id.to_string(),
          error,
        });
        // Failure never cascades: the branch halts here until a retry.
      }
    }

    self.refresh_run_status(&graph, run_id).await?;
    Ok(())
  }

  /// Complete a suspended gate with user input.
  #[instrument(skip(self, user_input), fields(run_id = %run_id, node_id = %node_id))]
  pub async fn complete_gate(
    &self,
    run_id: &str,
    node_id: &str,
    user_input: Value,
  ) -> Result<(), EngineError> {
    let run = self.store.get_run(run_id).await?;
    let graph = self.graph_for_run(&run)?;

    let node = graph
      .node(base_of(node_id))
      .ok_or_else(|| ValidationError::UnknownNode {
        node_id: node_id.to_string(),
      })?;
    if !matches!(node.kind, NodeKind::Gate(_)) {
      return Err(
        ValidationError::NotWaitingForInput {
          node_id: node_id.to_string(),
        }
        .into(),
      );
    }
    let state = run
      .node_states
      .get(node_id)
      .ok_or_else(|| ValidationError::UnknownNode {
        node_id: node_id.to_string(),
      })?;
    if state.status != NodeStatus::WaitingForInput {
      return Err(
        ValidationError::NotWaitingForInput {
          node_id: node_id.to_string(),
        }
        .into(),
      );
    }

    // The merge revalidates the transition, so two racing completions
    // cannot both land.
    let completed = NodeState::completed(state.input.clone(), user_input.clone());
    match self
      .store
      .atomic_merge(run_id, HashMap::from([(node_id.to_string(), completed)]))
      .await
    {
      Ok(_) => {}
      Err(StoreError::IllegalTransition { .. }) => {
        return Err(
          ValidationError::NotWaitingForInput {
            node_id: node_id.to_string(),
          }
          .into(),
        );
      }
      Err(err) => return Err(err.into()),
    }

    info!("gate completed");
    self.notifier.notify(ExecutionEvent::NodeCompleted {
      run_id: run_id.to_string(),
      node_id: node_id.to_string(),
      output: user_input,
    });
    self
      .advance(&graph, run_id, vec![node_id.to_string()])
      .await?;
    self.refresh_run_status(&graph, run_id).await?;
    Ok(())
  }

  /// Operator retry of a failed node.
  ///
  /// Resets just the targeted node to pending, then fires it immediately
  /// if its upstream dependencies are already satisfied. Never cascades
  /// upstream: completed nodes stay completed.
  #[instrument(skip(self), fields(run_id = %run_id, node_id = %node_id))]
  pub async fn retry_node(&self, run_id: &str, node_id: &str) -> Result<(), EngineError> {
    let run = self.store.get_run(run_id).await?;
    let graph = self.graph_for_run(&run)?;

    let base = base_of(node_id);
    if graph.node(base).is_none() {
      return Err(
        ValidationError::UnknownNode {
          node_id: node_id.to_string(),
        }
        .into(),
      );
    }
    let state = run
      .node_states
      .get(node_id)
      .ok_or_else(|| ValidationError::UnknownNode {
        node_id: node_id.to_string(),
      })?;

    // Keep the stored input: for parallel instances it is the seeded
    // element, for everything else the input merged at the original claim
    // (upstream outputs are immutable once completed, so it is still
    // accurate).
    let reset = NodeState {
      status: NodeStatus::Pending,
      input: state.input.clone(),
      output: None,
      error: None,
      upstream_completed_count: None,
      expected_upstream_count: None,
      upstream_outputs: None,
    };
    match self
      .store
      .atomic_merge(run_id, HashMap::from([(node_id.to_string(), reset.clone())]))
      .await
    {
      Ok(_) => {}
      Err(StoreError::IllegalTransition { .. }) => {
        return Err(
          ValidationError::NodeNotFailed {
            node_id: node_id.to_string(),
          }
          .into(),
        );
      }
      Err(err) => return Err(err.into()),
    }

    info!("node reset for retry");
    self.notifier.notify(ExecutionEvent::NodeRetried {
      run_id: run_id.to_string(),
      node_id: node_id.to_string(),
    });

    // Fire immediately if upstream is already satisfied; otherwise the
    // node waits for the next natural advance pass.
    let run = self.store.get_run(run_id).await?;
    if upstream_satisfied(&graph, &run.node_states, base) {
      let input = match reset.input {
        Some(input) => input,
        None => crate::input::merged_input(&graph, &run.node_states, base),
      };
      let fired = self.fire_node(&graph, run_id, node_id, input).await?;
      if fired == Fired::Completed {
        self
          .advance(&graph, run_id, vec![node_id.to_string()])
          .await?;
      }
    }

    self.refresh_run_status(&graph, run_id).await?;
    Ok(())
  }

  /// Read-only run snapshot for polling and display, with the status
  /// freshly derived from node states.
  pub async fn get_run(&self, run_id: &str) -> Result<Run, EngineError> {
    let mut run = self.store.get_run(run_id).await?;
    if let Ok(graph) = self.graph_for_run(&run) {
      run.status = run_status(&graph, &run.node_states);
    }
    Ok(run)
  }

  /// Runs for one graph, newest first.
  pub async fn list_runs(&self, graph_id: &str) -> Result<Vec<Run>, EngineError> {
    Ok(self.store.list_runs(graph_id).await?)
  }

  /// Recompute and persist the run's derived status.
  ///
  /// Idempotent: the status is a pure function of node states, and any
  /// later event recomputes it, so concurrent cascades racing this write
  /// converge on the same answer.
  pub(crate) async fn refresh_run_status(
    &self,
    graph: &ExecutionGraph,
    run_id: &str,
  ) -> Result<(), EngineError> {
    let run = self.store.get_run(run_id).await?;
    let status = run_status(graph, &run.node_states);
    if status == run.status {
      return Ok(());
    }

    let completed_at = status.is_terminal().then(Utc::now);
    self
      .store
      .update_run_status(run_id, status, completed_at)
      .await?;

    if status.is_terminal() {
      info!(run_id, status = status.as_str(), "run finished");
      self.notifier.notify(ExecutionEvent::RunFinished {
        run_id: run_id.to_string(),
        status,
      });
    }
    Ok(())
  }

  /// Invoke the entity relocation collaborator for a completed worker.
  /// Failures are logged and never touch run state.
  async fn relocate_entity(&self, run: &Run, cfg: &WorkerConfig, outcome: &str) {
    let (Some(hop), Some(entity_id)) = (&cfg.entity_move, &run.entity_ref) else {
      return;
    };
    let mv = EntityMove {
      entity_id: entity_id.clone(),
      target_section_id: hop.target_section_id.clone(),
      outcome: outcome.to_string(),
      new_entity_type: hop.new_entity_type.clone(),
    };
    if let Err(err) = self.entity_mover.relocate(mv).await {
      warn!(run_id = %run.run_id, error = %err, "entity relocation failed");
    }
  }
}
