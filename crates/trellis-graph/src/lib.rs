//! Trellis Graph
//!
//! This crate contains the author-facing workflow graph types and the
//! compiler that turns them into an executable form.
//!
//! Authors draw graphs in the editor: nodes carry UI metadata (labels,
//! canvas positions) alongside their typed configuration, edges may carry
//! field mappings for the data that flows across them. The compiler
//! validates the graph (unique ids, valid edges, no cycles, sane fan-out
//! configuration), strips everything the executor does not need, and
//! produces an [`ExecutionGraph`] with O(1) node and adjacency lookups and
//! precomputed entry/terminal node sets.
//!
//! Compilation is a pure function. A graph that fails to compile produces a
//! [`CompileError`] and nothing else.

mod compile;
mod def;
mod error;
mod graph;
mod instance;

pub use compile::compile;
pub use def::{
  CollectorConfig, EdgeDef, EntityHop, FieldMapping, GateConfig, GraphDef, MappingRule, NodeDef,
  NodeKind, SplitterConfig, WorkerConfig, lookup_path,
};
pub use error::CompileError;
pub use graph::{ExecutionGraph, ExecutionNode, version_ref};
pub use instance::{base_of, instance_id, is_reserved_id, split_instance};
