//! Graph compilation — run before publishing or executing a workflow.
//!
//! Rules enforced:
//! 1. Node ids are unique and never use the reserved `_<digits>` suffix.
//! 2. Every edge references existing nodes on both sides.
//! 3. The graph is acyclic. The executor walks edges with no cycle
//!    detection of its own, so a cyclic graph must die here.
//! 4. Every splitter has an unambiguous fan-out target, each target belongs
//!    to exactly one splitter, and nothing else feeds a fan-out target.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::def::{GraphDef, NodeKind, SplitterConfig};
use crate::error::CompileError;
use crate::graph::{ExecutionGraph, ExecutionNode, edge_key};
use crate::instance::is_reserved_id;

/// Compile an authored graph into its executable form.
///
/// Pure function: no I/O, no mutation of the input. Errors are returned,
/// never swallowed.
pub fn compile(def: &GraphDef) -> Result<ExecutionGraph, CompileError> {
  if def.nodes.is_empty() {
    return Err(CompileError::EmptyGraph);
  }

  let mut seen: HashSet<&str> = HashSet::new();
  for node in &def.nodes {
    if is_reserved_id(&node.id) {
      return Err(CompileError::ReservedNodeId(node.id.clone()));
    }
    if !seen.insert(node.id.as_str()) {
      return Err(CompileError::DuplicateNodeId(node.id.clone()));
    }
  }

  for edge in &def.edges {
    if !seen.contains(edge.source.as_str()) {
      return Err(CompileError::UnknownEdgeEndpoint {
        node_id: edge.source.clone(),
        side: "source",
      });
    }
    if !seen.contains(edge.target.as_str()) {
      return Err(CompileError::UnknownEdgeEndpoint {
        node_id: edge.target.clone(),
        side: "target",
      });
    }
  }

  let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
  let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();
  for node in &def.nodes {
    adjacency.entry(node.id.clone()).or_default();
    reverse_adjacency.entry(node.id.clone()).or_default();
  }
  for edge in &def.edges {
    adjacency
      .entry(edge.source.clone())
      .or_default()
      .push(edge.target.clone());
    reverse_adjacency
      .entry(edge.target.clone())
      .or_default()
      .push(edge.source.clone());
  }

  // Entry/terminal sets in authored node order, so firing order is stable.
  let entry_nodes: Vec<String> = def
    .nodes
    .iter()
    .filter(|n| reverse_adjacency[&n.id].is_empty())
    .map(|n| n.id.clone())
    .collect();
  let terminal_nodes: Vec<String> = def
    .nodes
    .iter()
    .filter(|n| adjacency[&n.id].is_empty())
    .map(|n| n.id.clone())
    .collect();

  if entry_nodes.is_empty() {
    return Err(CompileError::NoEntryNodes);
  }

  detect_cycle(def, &adjacency)?;

  // Resolve splitter fan-out targets and check their exclusivity.
  let mut fan_outs: HashMap<String, String> = HashMap::new();
  let mut resolved: HashMap<String, String> = HashMap::new();
  for node in &def.nodes {
    let NodeKind::Splitter(cfg) = &node.kind else {
      continue;
    };
    let downstream = &adjacency[&node.id];
    let target = match &cfg.fan_out {
      Some(target) => {
        if !downstream.contains(target) {
          return Err(CompileError::InvalidFanOut {
            splitter: node.id.clone(),
            target: target.clone(),
          });
        }
        target.clone()
      }
      None => {
        if downstream.len() != 1 {
          return Err(CompileError::AmbiguousFanOut {
            splitter: node.id.clone(),
            count: downstream.len(),
          });
        }
        downstream[0].clone()
      }
    };
    if fan_outs.insert(target.clone(), node.id.clone()).is_some() {
      return Err(CompileError::ConflictingFanOut(target));
    }
    resolved.insert(node.id.clone(), target);
  }

  for (target, splitter) in &fan_outs {
    if let Some(other) = reverse_adjacency[target].iter().find(|up| *up != splitter) {
      return Err(CompileError::FanOutTargetNotExclusive {
        target: target.clone(),
        other: other.clone(),
      });
    }
  }

  // Strip UI metadata, writing the resolved fan-out back into each splitter.
  let nodes: HashMap<String, ExecutionNode> = def
    .nodes
    .iter()
    .map(|n| {
      let kind = match &n.kind {
        NodeKind::Splitter(cfg) => NodeKind::Splitter(SplitterConfig {
          items_path: cfg.items_path.clone(),
          fan_out: resolved.get(&n.id).cloned(),
        }),
        other => other.clone(),
      };
      (
        n.id.clone(),
        ExecutionNode {
          id: n.id.clone(),
          kind,
        },
      )
    })
    .collect();

  let edge_mappings = def
    .edges
    .iter()
    .filter_map(|e| {
      e.mapping
        .as_ref()
        .map(|m| (edge_key(&e.source, &e.target), m.clone()))
    })
    .collect();

  let parallel_targets: HashSet<String> = fan_outs.into_keys().collect();

  Ok(ExecutionGraph::new(
    def.graph_id.clone(),
    def.version,
    nodes,
    adjacency,
    reverse_adjacency,
    edge_mappings,
    entry_nodes,
    terminal_nodes,
    parallel_targets,
  ))
}

/// Kahn's algorithm: if a topological order does not cover every node, a
/// cycle exists somewhere in the graph.
fn detect_cycle(
  def: &GraphDef,
  adjacency: &HashMap<String, Vec<String>>,
) -> Result<(), CompileError> {
  let mut in_degree: HashMap<&str, usize> = def.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
  for targets in adjacency.values() {
    for target in targets {
      *in_degree.entry(target.as_str()).or_insert(0) += 1;
    }
  }

  let mut queue: VecDeque<&str> = in_degree
    .iter()
    .filter(|&(_, &d)| d == 0)
    .map(|(&id, _)| id)
    .collect();

  let mut visited = 0usize;
  while let Some(node_id) = queue.pop_front() {
    visited += 1;
    if let Some(targets) = adjacency.get(node_id) {
      for target in targets {
        let degree = in_degree.entry(target.as_str()).or_insert(0);
        *degree -= 1;
        if *degree == 0 {
          queue.push_back(target.as_str());
        }
      }
    }
  }

  if visited != def.nodes.len() {
    return Err(CompileError::CycleDetected);
  }
  Ok(())
}
