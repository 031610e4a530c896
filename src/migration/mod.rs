//! Lazy, per-entity schema migrations.
//!
//! A [`MigrationPlan`] is an ordered list of versioned steps. Running it
//! against an entity applies every step whose version is above the entity's
//! stored version (`CAFUSV`), in order, persisting the new version right after
//! each step. Steps only get a [`MigrationContext`], which can add missing
//! attributes but never overwrite existing ones, so a plan is additive and
//! idempotent by construction.
//!
//! Plans run inline on every observed interaction, so step bodies should be
//! presence checks and cheap writes.

mod plan;
mod runner;

pub use plan::{MigrationPlan, MigrationStep};
pub use runner::{MigrationContext, MigrationReport};

/// Attribute holding the entity's schema version.
pub const SCHEMA_VERSION_KEY: &str = "CAFUSV";
