//! Entity relocation boundary.
//!
//! Runs may track an "entity" (a lead, a customer) moving through the
//! workflow. When a worker node configured with an entity move completes,
//! the engine invokes this collaborator. The semantics of entities,
//! sections, and the journey log live outside the engine; failures here are
//! logged and never affect run state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A requested entity relocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMove {
  pub entity_id: String,
  pub target_section_id: String,
  /// Outcome of the node that triggered the move, e.g. `"completed"`.
  pub outcome: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new_entity_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("entity relocation failed: {0}")]
pub struct EntityMoveError(pub String);

/// Boundary trait for the entity tracking collaborator.
#[async_trait]
pub trait EntityMover: Send + Sync {
  async fn relocate(&self, mv: EntityMove) -> Result<(), EntityMoveError>;
}

/// Discards relocation requests. The default when no entity tracking is
/// wired up.
#[derive(Debug, Clone, Default)]
pub struct NoopMover;

#[async_trait]
impl EntityMover for NoopMover {
  async fn relocate(&self, _mv: EntityMove) -> Result<(), EntityMoveError> {
    Ok(())
  }
}
