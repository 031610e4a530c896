// ============================================================================
// chatstate: per-entity persistent state for a multi-platform chat bot
// ============================================================================
//
// One JSON document per user/channel, cached per namespace, written through
// to disk, upgraded lazily by versioned migrations, and rate-limited by a
// cooldown coordinator. All of it is reached through `StateLayer`.

pub mod config;
pub mod cooldown;
pub mod core;
pub mod facade;
pub mod migration;
pub mod prelude;
pub mod serializer;
pub mod storage;

// Re-export main types for convenience
pub use crate::config::{NamespaceConfig, StateConfig};
pub use crate::cooldown::{AllowReason, CooldownCoordinator, CooldownDecision, CooldownRequest, DenyReason};
pub use crate::core::{
    Clock, Document, EntityKey, ManualClock, Platform, Result, SchemaVersion, StateError,
    SystemClock,
};
pub use crate::facade::{StateLayer, StateStats};
pub use crate::migration::{MigrationContext, MigrationPlan, MigrationReport, MigrationStep, SCHEMA_VERSION_KEY};
pub use crate::serializer::{EntityGuard, InteractionSerializer};
pub use crate::storage::{EntityHandle, EntityStore};
