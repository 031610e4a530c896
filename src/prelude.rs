//! Recommended API entrypoints grouped by abstraction level.
//!
//! `bot` is what command handlers and the message pipeline need.
//! `advanced` exposes per-namespace stores and the cache for tooling and tests.

pub mod bot {
    //! Everyday surface: open the layer once, then lock, migrate, check
    //! cooldowns and read/write attributes through it.
    pub use crate::{
        CooldownDecision, CooldownRequest, Document, EntityKey, MigrationPlan, MigrationStep,
        Platform, StateConfig, StateLayer,
    };
}

pub mod advanced {
    //! Escape hatch for the building blocks behind `StateLayer`.
    pub use crate::config::{DocumentLayout, NamespaceConfig, ReadDefaultPolicy};
    pub use crate::core::{Clock, ManualClock, SystemClock};
    pub use crate::cooldown::CooldownCoordinator;
    pub use crate::serializer::{EntityGuard, InteractionSerializer, LockSweeper};
    pub use crate::storage::{BoundedCache, CacheStats, EntityHandle, EntityStore, codec};
}
