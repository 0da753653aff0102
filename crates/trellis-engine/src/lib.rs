//! Trellis Engine
//!
//! The execution engine of the Trellis workflow platform: it takes a
//! compiled [`trellis_graph::ExecutionGraph`], freezes runs against it, and
//! advances each run reactively as external events arrive.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │  - graph registry (published versions)                      │
//! │  - boundaries: start_run / worker_callback / complete_gate  │
//! │    / retry_node / get_run                                   │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Scheduler                             │
//! │  - iterative work-list cascade after each completion        │
//! │  - readiness checks resolving parallel instances            │
//! │  - input merging with per-edge field mappings               │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    trellis-store                            │
//! │  - node_states map, mutated only via atomic_merge           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine has no worker threads and no internal queue: every boundary
//! call runs its cascade to completion on the caller. Concurrent calls are
//! expected — many workers report within milliseconds of each other — and
//! are safe because the only shared mutable state is the run's node-state
//! map, which is only ever touched through the store's atomic per-key
//! merge. Nothing in this crate reads run state and writes it back.

mod callback;
mod engine;
mod entity;
mod error;
mod events;
mod fire;
mod input;
mod scheduler;

pub use callback::CallbackPayload;
pub use engine::Engine;
pub use entity::{EntityMove, EntityMoveError, EntityMover, NoopMover};
pub use error::{EngineError, ValidationError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use scheduler::run_status;
