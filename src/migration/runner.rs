use super::SCHEMA_VERSION_KEY;
use super::plan::MigrationPlan;
use crate::core::{EntityKey, SchemaVersion};
use crate::storage::EntityHandle;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// What a migration step may do to an entity: look, and add what is missing.
pub struct MigrationContext<'a> {
    entity: EntityHandle<'a>,
    writes: usize,
}

impl<'a> MigrationContext<'a> {
    fn new(entity: EntityHandle<'a>) -> Self {
        Self { entity, writes: 0 }
    }

    pub fn key(&self) -> &EntityKey {
        self.entity.key()
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.entity.contains(attr)
    }

    pub fn peek<T: DeserializeOwned>(&self, attr: &str) -> Option<T> {
        self.entity.peek(attr)
    }

    /// Sets `attr` only if it is absent. The write lands in the cached document
    /// and is persisted together with the step's version bump.
    pub fn set_if_missing<T: Serialize>(&mut self, attr: &str, value: T) -> bool {
        let written = self.entity.set_if_missing(attr, value, false);
        if written {
            self.writes += 1;
        }
        written
    }

    pub fn writes(&self) -> usize {
        self.writes
    }
}

/// Outcome of running a plan against one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub entity: EntityKey,
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub applied: Vec<SchemaVersion>,
    /// Attribute writes performed by step bodies (version bumps excluded).
    pub writes: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

impl MigrationPlan {
    /// Reads the entity's stored version and applies every pending step.
    ///
    /// The version is persisted right after each step, so an interruption
    /// leaves the entity at the last completed step and the next run resumes
    /// from there. An entity already ahead of this plan is left alone.
    pub fn run(&self, entity: &EntityHandle<'_>) -> MigrationReport {
        let from_version = entity
            .peek::<SchemaVersion>(SCHEMA_VERSION_KEY)
            .unwrap_or(SchemaVersion::ZERO);
        let mut current = from_version;
        let mut applied = Vec::new();
        let mut writes = 0;

        for step in self.pending(from_version) {
            let mut ctx = MigrationContext::new(entity.clone());
            step.apply(&mut ctx);
            writes += ctx.writes();

            entity.save(SCHEMA_VERSION_KEY, step.version());
            current = step.version();
            applied.push(current);
            debug!(
                sector = "migration",
                entity = %entity.key(),
                version = %current,
                writes = ctx.writes(),
                "migration step applied"
            );
        }

        if !applied.is_empty() {
            let versions = applied
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            info!(
                sector = "migration",
                namespace = entity.store().name(),
                entity = %entity.key(),
                versions = %versions,
                "migrated to {}",
                current
            );
        }

        MigrationReport {
            entity: entity.key().clone(),
            from_version,
            to_version: current,
            applied,
            writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceConfig;
    use crate::core::Platform;
    use crate::storage::EntityStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn plan(calls: Arc<AtomicUsize>) -> MigrationPlan {
        let mut plan = MigrationPlan::new();
        let first = calls.clone();
        plan.add(1.0, move |ctx| {
            first.fetch_add(1, Ordering::SeqCst);
            ctx.set_if_missing("balance", 0i64);
            ctx.set_if_missing("language", "en");
        })
        .unwrap();
        let second = calls;
        plan.add(1.1, move |ctx| {
            second.fetch_add(1, Ordering::SeqCst);
            ctx.set_if_missing("isBanned", false);
        })
        .unwrap();
        plan
    }

    #[test]
    fn test_fresh_entity_gets_every_step_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = EntityStore::new(NamespaceConfig::new("users", temp_dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));
        let entity = store.entity(&EntityKey::new(Platform::Twitch, "1"));

        let report = plan(calls.clone()).run(&entity);

        assert_eq!(report.from_version, SchemaVersion::ZERO);
        assert_eq!(report.applied, vec![SchemaVersion::new(1.0), SchemaVersion::new(1.1)]);
        assert_eq!(report.writes, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(entity.peek::<f64>(SCHEMA_VERSION_KEY), Some(1.1));
    }

    #[test]
    fn test_second_run_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let store = EntityStore::new(NamespaceConfig::new("users", temp_dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));
        let plan = plan(calls.clone());
        let entity = store.entity(&EntityKey::new(Platform::Twitch, "1"));

        plan.run(&entity);
        let before = entity.document();
        let report = plan.run(&entity);

        assert!(report.is_noop());
        assert_eq!(report.writes, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(entity.document(), before);
    }

    #[test]
    fn test_resumes_from_stored_version() {
        let temp_dir = TempDir::new().unwrap();
        let store = EntityStore::new(NamespaceConfig::new("users", temp_dir.path()));
        let entity = store.entity(&EntityKey::new(Platform::Twitch, "1"));
        entity.save(SCHEMA_VERSION_KEY, 1.0);

        let report = plan(Arc::new(AtomicUsize::new(0))).run(&entity);

        assert_eq!(report.applied, vec![SchemaVersion::new(1.1)]);
        assert!(!entity.contains("balance"));
        assert!(entity.contains("isBanned"));
    }
}
