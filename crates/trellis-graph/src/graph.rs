use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::def::{FieldMapping, NodeKind};

/// A compiled node: id plus typed configuration, UI metadata stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
  pub id: String,
  pub kind: NodeKind,
}

/// The version reference a run is frozen against, e.g. `"pipeline@v3"`.
pub fn version_ref(graph_id: &str, version: u32) -> String {
  format!("{graph_id}@v{version}")
}

/// The compiled, executable form of an authored graph.
///
/// Immutable once compiled; one instance exists per published version of a
/// workflow. Node ids are carried over from the authored graph verbatim —
/// they are the identity contract between the editor, the engine, and the
/// run state, and are never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
  graph_id: String,
  version: u32,
  nodes: HashMap<String, ExecutionNode>,
  adjacency: HashMap<String, Vec<String>>,
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Field mappings keyed by `"source->target"`.
  edge_mappings: HashMap<String, FieldMapping>,
  entry_nodes: Vec<String>,
  terminal_nodes: Vec<String>,
  /// Node ids a splitter fans out into. These materialize at run time as
  /// parallel instances, never under their static id.
  parallel_targets: HashSet<String>,
}

impl ExecutionGraph {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    graph_id: String,
    version: u32,
    nodes: HashMap<String, ExecutionNode>,
    adjacency: HashMap<String, Vec<String>>,
    reverse_adjacency: HashMap<String, Vec<String>>,
    edge_mappings: HashMap<String, FieldMapping>,
    entry_nodes: Vec<String>,
    terminal_nodes: Vec<String>,
    parallel_targets: HashSet<String>,
  ) -> Self {
    Self {
      graph_id,
      version,
      nodes,
      adjacency,
      reverse_adjacency,
      edge_mappings,
      entry_nodes,
      terminal_nodes,
      parallel_targets,
    }
  }

  pub fn graph_id(&self) -> &str {
    &self.graph_id
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  /// The version reference runs are frozen against.
  pub fn version_ref(&self) -> String {
    version_ref(&self.graph_id, self.version)
  }

  /// Look up a node by its static id.
  pub fn node(&self, node_id: &str) -> Option<&ExecutionNode> {
    self.nodes.get(node_id)
  }

  pub fn node_ids(&self) -> impl Iterator<Item = &str> {
    self.nodes.keys().map(String::as_str)
  }

  pub fn node_count(&self) -> usize {
    self.nodes.len()
  }

  /// Downstream node ids, in authored edge order.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Upstream node ids, in authored edge order.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// The field mapping on the `source -> target` edge, if any.
  pub fn mapping(&self, source: &str, target: &str) -> Option<&FieldMapping> {
    self.edge_mappings.get(&edge_key(source, target))
  }

  /// Nodes with no incoming edges; every run starts by firing these.
  pub fn entry_nodes(&self) -> &[String] {
    &self.entry_nodes
  }

  /// Nodes with no outgoing edges.
  pub fn terminal_nodes(&self) -> &[String] {
    &self.terminal_nodes
  }

  /// Whether `node_id` is the fan-out target of a splitter.
  pub fn is_parallel_target(&self, node_id: &str) -> bool {
    self.parallel_targets.contains(node_id)
  }

  /// The splitter feeding a parallel target. Compilation guarantees a
  /// parallel target has exactly one upstream, the splitter itself.
  pub fn splitter_feeding(&self, target: &str) -> Option<&str> {
    if !self.is_parallel_target(target) {
      return None;
    }
    self.upstream(target).first().map(String::as_str)
  }
}

pub(crate) fn edge_key(source: &str, target: &str) -> String {
  format!("{source}->{target}")
}
