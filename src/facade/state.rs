use crate::config::StateConfig;
use crate::cooldown::{CooldownCoordinator, CooldownDecision, CooldownRequest};
use crate::core::{Clock, Document, EntityKey, Result, StateError, SystemClock};
use crate::migration::{MigrationPlan, MigrationReport};
use crate::serializer::{InteractionSerializer, LockSweeper, spawn_lock_sweeper};
use crate::storage::{CacheStats, EntityHandle, EntityStore};
use chrono::Duration;
use std::fs;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Cache and slot counters for every namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateStats {
    pub users: CacheStats,
    pub bank: CacheStats,
    pub channel_settings: CacheStats,
    pub channel_cooldowns: CacheStats,
    pub entity_slots: usize,
}

/// The bot's state layer: every namespace store, the cooldown coordinator,
/// the user migration plan and the interaction serializer, constructed once
/// at startup and passed to whoever needs them.
pub struct StateLayer {
    config: StateConfig,
    clock: Arc<dyn Clock>,
    users: Arc<EntityStore>,
    bank: Arc<EntityStore>,
    channel_settings: Arc<EntityStore>,
    channel_cooldowns: Arc<EntityStore>,
    cooldowns: CooldownCoordinator,
    serializer: Arc<InteractionSerializer>,
    migrations: MigrationPlan,
}

impl StateLayer {
    pub fn open(config: StateConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: StateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().map_err(StateError::ConfigError)?;

        let namespaces = [
            config.users_namespace(),
            config.bank_namespace(),
            config.channel_settings_namespace(),
            config.channel_cooldowns_namespace(),
        ];
        for namespace in &namespaces {
            namespace.validate().map_err(StateError::ConfigError)?;
            let dir = namespace.root.join(&namespace.name);
            fs::create_dir_all(&dir).map_err(|err| {
                StateError::IoError(format!(
                    "Failed to create namespace directory '{}': {}",
                    dir.display(),
                    err
                ))
            })?;
        }
        let [users, bank, channel_settings, channel_cooldowns] =
            namespaces.map(|namespace| Arc::new(EntityStore::new(namespace)));

        let cooldowns =
            CooldownCoordinator::new(users.clone(), channel_cooldowns.clone(), clock.clone());
        let serializer = Arc::new(InteractionSerializer::new(clock.clone()));

        info!(
            sector = "store",
            base_dir = %config.base_dir.display(),
            bank_dir = %config.bank_dir.display(),
            "state layer opened"
        );

        Ok(Self {
            config,
            clock,
            users,
            bank,
            channel_settings,
            channel_cooldowns,
            cooldowns,
            serializer,
            migrations: MigrationPlan::new(),
        })
    }

    /// Sets the plan applied to user documents on every interaction.
    pub fn with_migrations(mut self, plan: MigrationPlan) -> Self {
        self.migrations = plan;
        self
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn users(&self) -> &Arc<EntityStore> {
        &self.users
    }

    pub fn bank(&self) -> &Arc<EntityStore> {
        &self.bank
    }

    pub fn channel_settings(&self) -> &Arc<EntityStore> {
        &self.channel_settings
    }

    pub fn channel_cooldowns(&self) -> &Arc<EntityStore> {
        &self.channel_cooldowns
    }

    pub fn serializer(&self) -> &Arc<InteractionSerializer> {
        &self.serializer
    }

    pub fn cooldowns(&self) -> &CooldownCoordinator {
        &self.cooldowns
    }

    pub fn migrations(&self) -> &MigrationPlan {
        &self.migrations
    }

    pub fn user(&self, key: &EntityKey) -> EntityHandle<'_> {
        self.users.entity(key)
    }

    pub fn run_migrations(&self, key: &EntityKey) -> MigrationReport {
        self.migrations.run(&self.users.entity(key))
    }

    /// Writes every default the user does not have yet, in one flush.
    /// Returns how many attributes were added.
    pub fn register_user(&self, key: &EntityKey, defaults: &Document) -> usize {
        let user = self.users.entity(key);
        let mut written = 0;
        for (attr, value) in defaults.iter() {
            if user.set_if_missing(attr, value, false) {
                written += 1;
            }
        }
        if written > 0 {
            user.flush();
        }
        written
    }

    pub fn check_cooldown(&self, request: &CooldownRequest) -> CooldownDecision {
        self.cooldowns.check(request)
    }

    pub fn remaining_cooldown(
        &self,
        user: &EntityKey,
        cooldown_key: &str,
        user_cooldown: Duration,
    ) -> Duration {
        self.cooldowns.remaining(user, cooldown_key, user_cooldown)
    }

    pub async fn with_exclusive_access<F, Fut, T>(&self, key: &EntityKey, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.serializer.with_exclusive_access(key, f).await
    }

    /// Inbound message or command for `key`: take the user's slot, bring the
    /// user's schema up to date, run `f`, release.
    pub async fn handle_interaction<F, Fut, T>(&self, key: &EntityKey, f: F) -> T
    where
        F: FnOnce(MigrationReport) -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.serializer.acquire(key).await;
        let report = self.run_migrations(key);
        f(report).await
    }

    /// Starts the background sweep of idle entity slots.
    pub fn spawn_lock_sweeper(&self) -> LockSweeper {
        let horizon = Duration::from_std(self.config.lock_idle_horizon)
            .unwrap_or_else(|_| Duration::seconds(600));
        spawn_lock_sweeper(self.serializer.clone(), self.config.sweep_interval, horizon)
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            users: self.users.cache_stats(),
            bank: self.bank.cache_stats(),
            channel_settings: self.channel_settings.cache_stats(),
            channel_cooldowns: self.channel_cooldowns.cache_stats(),
            entity_slots: self.serializer.slot_count(),
        }
    }

    /// Persists every dirty document in every namespace.
    pub fn close(&self) -> usize {
        let written: usize = self.stores().map(|store| store.flush_all()).sum();
        info!(sector = "store", written, "state layer flushed");
        written
    }

    fn stores(&self) -> impl Iterator<Item = &Arc<EntityStore>> {
        [
            &self.users,
            &self.bank,
            &self.channel_settings,
            &self.channel_cooldowns,
        ]
        .into_iter()
    }
}

impl Drop for StateLayer {
    fn drop(&mut self) {
        for store in self.stores() {
            store.flush_all();
        }
    }
}
