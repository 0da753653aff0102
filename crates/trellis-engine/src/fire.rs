//! Node firing — the single dispatch switch over the closed node-kind set.
//!
//! Every fire starts with a claim: one atomic merge moving the node out of
//! `pending`. Losing the claim means another cascade got there first, and
//! the loser walks away without side effects — that claim, not any local
//! bookkeeping, is the guard against double-firing under duplicate
//! delivery.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use trellis_dispatch::WorkerCall;
use trellis_graph::{CollectorConfig, ExecutionGraph, NodeKind, base_of, instance_id, lookup_path};
use trellis_store::{Error as StoreError, NodeState, NodeStatus};

use crate::engine::Engine;
use crate::error::{EngineError, ValidationError};
use crate::events::{ExecutionEvent, ExecutionNotifier};
use crate::scheduler::instances_of;

/// What firing a node amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fired {
  /// Worker call dispatched; completion arrives via callback.
  Dispatched,
  /// The node completed synchronously (splitter, collector).
  Completed,
  /// A gate suspended its branch.
  Waiting,
  /// The node failed while firing; its branch is halted.
  Failed,
  /// Another cascade claimed the node first. No-op.
  AlreadyClaimed,
}

impl<N: ExecutionNotifier> Engine<N> {
  /// Fire one ready node (or parallel instance) with the given input.
  pub(crate) async fn fire_node(
    &self,
    graph: &ExecutionGraph,
    run_id: &str,
    target_id: &str,
    input: Value,
  ) -> Result<Fired, EngineError> {
    let base = base_of(target_id);
    let Some(node) = graph.node(base) else {
      return Err(
        ValidationError::UnknownNode {
          node_id: target_id.to_string(),
        }
        .into(),
      );
    };

    match &node.kind {
      NodeKind::Worker(cfg) => {
        if !self
          .try_claim(run_id, target_id, NodeState::running(input.clone()))
          .await?
        {
          return Ok(Fired::AlreadyClaimed);
        }
        self.notifier.notify(ExecutionEvent::NodeFired {
          run_id: run_id.to_string(),
          node_id: target_id.to_string(),
        });

        let call = WorkerCall {
          run_id: run_id.to_string(),
          node_id: target_id.to_string(),
          config: cfg.config.clone(),
          input: input.clone(),
          callback_url: self.dispatcher.callback_url(run_id, target_id),
        };

        info!(run_id, node_id = %target_id, endpoint = %cfg.endpoint, "worker dispatched");
        if let Err(err) = self.dispatcher.dispatch(&cfg.endpoint, call).await {
          self
            .record_failure(run_id, target_id, input, format!("dispatch failed: {err}"))
            .await?;
          return Ok(Fired::Failed);
        }
        Ok(Fired::Dispatched)
      }

      NodeKind::Splitter(cfg) => {
        if !self
          .try_claim(run_id, target_id, NodeState::running(input.clone()))
          .await?
        {
          return Ok(Fired::AlreadyClaimed);
        }
        self.notifier.notify(ExecutionEvent::NodeFired {
          run_id: run_id.to_string(),
          node_id: target_id.to_string(),
        });

        let items = lookup_path(&input, &cfg.items_path).and_then(Value::as_array).cloned();
        let Some(items) = items else {
          self
            .record_failure(
              run_id,
              target_id,
              input,
              format!("splitter input has no array at path '{}'", cfg.items_path),
            )
            .await?;
          return Ok(Fired::Failed);
        };
        let Some(fan_out) = cfg.fan_out.as_deref() else {
          // Compilation resolves every splitter's fan-out; an unresolved
          // one can only mean the graph bypassed the compiler.
          self
            .record_failure(
              run_id,
              target_id,
              input,
              "splitter has no fan-out target".to_string(),
            )
            .await?;
          return Ok(Fired::Failed);
        };

        // One merge completes the splitter and seeds its instances, so no
        // observer ever sees the fan-out half-created.
        let mut update: HashMap<String, NodeState> = items
          .iter()
          .enumerate()
          .map(|(index, item)| {
            (
              instance_id(fan_out, index),
              NodeState::pending_with_input(item.clone()),
            )
          })
          .collect();
        update.insert(
          target_id.to_string(),
          NodeState::completed(Some(input.clone()), input.clone()),
        );
        self.store.atomic_merge(run_id, update).await?;

        info!(run_id, node_id = %target_id, instances = items.len(), "splitter fanned out");
        self.notifier.notify(ExecutionEvent::NodeCompleted {
          run_id: run_id.to_string(),
          node_id: target_id.to_string(),
          output: input,
        });
        Ok(Fired::Completed)
      }

      NodeKind::Gate(_) => {
        if !self
          .try_claim(run_id, target_id, NodeState::waiting_for_input(input))
          .await?
        {
          return Ok(Fired::AlreadyClaimed);
        }
        info!(run_id, node_id = %target_id, "gate waiting for input");
        self.notifier.notify(ExecutionEvent::GateWaiting {
          run_id: run_id.to_string(),
          node_id: target_id.to_string(),
        });
        Ok(Fired::Waiting)
      }

      NodeKind::Collector(cfg) => {
        // Normally completed from the scheduler's readiness pass; firing
        // one directly only happens for degenerate entry collectors.
        let run = self.store.get_run(run_id).await?;
        self
          .complete_collector(graph, run_id, target_id, cfg, &run.node_states)
          .await
      }
    }
  }

  /// Aggregate a ready collector and mark it completed.
  pub(crate) async fn complete_collector(
    &self,
    graph: &ExecutionGraph,
    run_id: &str,
    target_id: &str,
    cfg: &CollectorConfig,
    states: &HashMap<String, NodeState>,
  ) -> Result<Fired, EngineError> {
    let base = base_of(target_id);
    let contributions = collector_contributions(graph, states, base);

    // Ordered by upstream edge then instance index — never by callback
    // arrival — so the aggregate is deterministic under any timing.
    let outputs: Vec<Value> = contributions
      .iter()
      .map(|(_, output)| output.clone())
      .collect();
    let count = outputs.len() as u32;
    let upstream_outputs: BTreeMap<String, Value> = contributions.into_iter().collect();

    let mut output = Map::new();
    output.insert(cfg.output_key.clone(), Value::Array(outputs));
    let output = Value::Object(output);

    let state = NodeState {
      status: NodeStatus::Completed,
      input: None,
      output: Some(output.clone()),
      error: None,
      upstream_completed_count: Some(count),
      expected_upstream_count: Some(count),
      upstream_outputs: Some(upstream_outputs),
    };

    match self
      .store
      .atomic_merge(run_id, HashMap::from([(target_id.to_string(), state)]))
      .await
    {
      Ok(_) => {
        info!(run_id, node_id = %target_id, collected = count, "collector completed");
        self.notifier.notify(ExecutionEvent::NodeCompleted {
          run_id: run_id.to_string(),
          node_id: target_id.to_string(),
          output,
        });
        Ok(Fired::Completed)
      }
      Err(StoreError::IllegalTransition { .. }) => Ok(Fired::AlreadyClaimed),
      Err(err) => Err(err.into()),
    }
  }

  /// Refresh an unready collector's progress counters so polling clients
  /// can watch the fan-in fill up.
  pub(crate) async fn refresh_collector_counters(
    &self,
    graph: &ExecutionGraph,
    run_id: &str,
    collector_id: &str,
    states: &HashMap<String, NodeState>,
  ) -> Result<(), EngineError> {
    let Some(current) = states.get(collector_id) else {
      return Ok(());
    };
    if current.status != NodeStatus::Pending {
      return Ok(());
    }

    let base = base_of(collector_id);
    let (completed, expected) = collector_progress(graph, states, base);
    if current.upstream_completed_count == Some(completed)
      && current.expected_upstream_count == Some(expected)
    {
      return Ok(());
    }

    let so_far: BTreeMap<String, Value> = collector_contributions(graph, states, base)
      .into_iter()
      .collect();
    let state = NodeState {
      status: NodeStatus::Pending,
      input: None,
      output: None,
      error: None,
      upstream_completed_count: Some(completed),
      expected_upstream_count: Some(expected),
      upstream_outputs: Some(so_far),
    };

    match self
      .store
      .atomic_merge(run_id, HashMap::from([(collector_id.to_string(), state)]))
      .await
    {
      Ok(_) => Ok(()),
      // Racing a concurrent cascade that just completed the collector.
      Err(StoreError::IllegalTransition { .. }) => Ok(()),
      Err(err) => Err(err.into()),
    }
  }

  /// Record a node execution failure. The branch halts here; nothing
  /// downstream fires until an operator retry succeeds.
  pub(crate) async fn record_failure(
    &self,
    run_id: &str,
    node_id: &str,
    input: Value,
    error: String,
  ) -> Result<(), EngineError> {
    warn!(run_id, node_id = %node_id, error = %error, "node failed");
    self
      .store
      .atomic_merge(
        run_id,
        HashMap::from([(
          node_id.to_string(),
          NodeState::failed(Some(input), error.clone()),
        )]),
      )
      .await?;
    self.notifier.notify(ExecutionEvent::NodeFailed {
      run_id: run_id.to_string(),
      node_id: node_id.to_string(),
      error,
    });
    Ok(())
  }

  /// Claim a node through the store's transition validation. `false` means
  /// another cascade already moved it — the caller must walk away.
  pub(crate) async fn try_claim(
    &self,
    run_id: &str,
    node_id: &str,
    state: NodeState,
  ) -> Result<bool, EngineError> {
    match self
      .store
      .atomic_merge(run_id, HashMap::from([(node_id.to_string(), state)]))
      .await
    {
      Ok(_) => Ok(true),
      Err(StoreError::IllegalTransition { from, to, .. }) => {
        debug!(run_id, node_id = %node_id, from = from.as_str(), to = to.as_str(), "claim lost");
        Ok(false)
      }
      Err(err) => Err(err.into()),
    }
  }
}

/// Completed outputs feeding a collector, as `(contributor id, output)`
/// pairs in upstream-edge order then instance-index order.
fn collector_contributions(
  graph: &ExecutionGraph,
  states: &HashMap<String, NodeState>,
  collector_base: &str,
) -> Vec<(String, Value)> {
  let mut contributions = Vec::new();
  for upstream in graph.upstream(collector_base) {
    for id in contributor_ids(graph, states, upstream) {
      let Some(state) = states.get(&id) else {
        continue;
      };
      if state.status != NodeStatus::Completed {
        continue;
      }
      if let Some(output) = &state.output {
        contributions.push((id, output.clone()));
      }
    }
  }
  contributions
}

/// `(completed, expected)` contributor counts for a collector.
fn collector_progress(
  graph: &ExecutionGraph,
  states: &HashMap<String, NodeState>,
  collector_base: &str,
) -> (u32, u32) {
  let mut completed = 0u32;
  let mut expected = 0u32;
  for upstream in graph.upstream(collector_base) {
    for id in contributor_ids(graph, states, upstream) {
      expected += 1;
      if states.get(&id).map(|s| s.status) == Some(NodeStatus::Completed) {
        completed += 1;
      }
    }
  }
  (completed, expected)
}

/// The concrete contributor ids one upstream base resolves to.
fn contributor_ids(
  graph: &ExecutionGraph,
  states: &HashMap<String, NodeState>,
  upstream: &str,
) -> Vec<String> {
  let instances = instances_of(states, upstream);
  if !instances.is_empty() {
    instances.into_iter().map(|(_, id)| id).collect()
  } else if graph.is_parallel_target(upstream) {
    // Zero instances: an empty fan-out contributes nothing.
    Vec::new()
  } else {
    vec![upstream.to_string()]
  }
}
