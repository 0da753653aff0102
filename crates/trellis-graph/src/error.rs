use thiserror::Error;

/// Why a graph failed to compile. Fatal: no run can start against it, and a
/// failed compile never disturbs a previously published version.
#[derive(Debug, Error)]
pub enum CompileError {
  #[error("graph has no nodes")]
  EmptyGraph,

  #[error("duplicate node id: {0}")]
  DuplicateNodeId(String),

  #[error("node id '{0}' ends in the reserved parallel-instance suffix '_<digits>'")]
  ReservedNodeId(String),

  #[error("edge references unknown node: {side}={node_id}")]
  UnknownEdgeEndpoint {
    node_id: String,
    side: &'static str,
  },

  #[error("graph contains a cycle; the executor would never terminate")]
  CycleDetected,

  #[error("graph has no entry nodes (every node has incoming edges)")]
  NoEntryNodes,

  #[error("splitter '{splitter}' fan-out target '{target}' is not one of its downstream nodes")]
  InvalidFanOut { splitter: String, target: String },

  #[error("splitter '{splitter}' has {count} downstream nodes and no explicit fan_out")]
  AmbiguousFanOut { splitter: String, count: usize },

  #[error("node '{0}' is the fan-out target of more than one splitter")]
  ConflictingFanOut(String),

  #[error("fan-out target '{target}' may only be fed by its splitter, found edge from '{other}'")]
  FanOutTargetNotExclusive { target: String, other: String },
}
