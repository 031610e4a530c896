//! Per-entity mutual exclusion for read-modify-write sequences.
//!
//! Every entity gets a reusable async mutex ("slot") the first time it is
//! acquired. Holding the slot is what makes migration, cooldown checks and
//! attribute updates on that entity totally ordered; different entities never
//! contend. Guards release on drop, so a panicking or cancelled holder still
//! frees the slot.

mod sweeper;

pub use sweeper::{LockSweeper, spawn_lock_sweeper};

use crate::core::{Clock, EntityKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    last_acquired: DateTime<Utc>,
}

/// Exclusive hold on one entity's slot.
pub struct EntityGuard {
    key: EntityKey,
    _permit: OwnedMutexGuard<()>,
}

impl EntityGuard {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }
}

impl std::fmt::Debug for EntityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGuard").field("key", &self.key).finish()
    }
}

pub struct InteractionSerializer {
    slots: Mutex<HashMap<EntityKey, Slot>>,
    clock: Arc<dyn Clock>,
}

impl InteractionSerializer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }

    // The map only holds handles; a panic elsewhere cannot leave it inconsistent.
    fn slots(&self) -> MutexGuard<'_, HashMap<EntityKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clones the entity's handle, creating it if needed. The clone is taken
    /// under the map lock, which is what keeps the sweeper from removing a
    /// slot somebody is about to wait on.
    fn checkout(&self, key: &EntityKey) -> Arc<AsyncMutex<()>> {
        let now = self.clock.now_utc();
        let mut slots = self.slots();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            lock: Arc::new(AsyncMutex::new(())),
            last_acquired: now,
        });
        slot.last_acquired = now;
        slot.lock.clone()
    }

    /// Waits for and takes the entity's slot.
    pub async fn acquire(&self, key: &EntityKey) -> EntityGuard {
        let lock = self.checkout(key);
        EntityGuard {
            key: key.clone(),
            _permit: lock.lock_owned().await,
        }
    }

    /// Takes the entity's slot only if it is free right now.
    pub fn try_acquire(&self, key: &EntityKey) -> Option<EntityGuard> {
        let lock = self.checkout(key);
        lock.try_lock_owned().ok().map(|permit| EntityGuard {
            key: key.clone(),
            _permit: permit,
        })
    }

    /// Runs `f` while holding the entity's slot.
    pub async fn with_exclusive_access<F, Fut, T>(&self, key: &EntityKey, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        f().await
    }

    pub fn is_held(&self, key: &EntityKey) -> bool {
        self.slots()
            .get(key)
            .map(|slot| slot.lock.try_lock().is_err())
            .unwrap_or(false)
    }

    pub fn slot_count(&self) -> usize {
        self.slots().len()
    }

    /// Drops slots idle for at least `idle_horizon` that nobody holds or waits on.
    pub fn sweep(&self, idle_horizon: Duration) -> usize {
        let now = self.clock.now_utc();
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| {
            let idle = now - slot.last_acquired >= idle_horizon;
            let referenced = Arc::strong_count(&slot.lock) > 1;
            !idle || referenced
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!(sector = "serializer", removed, remaining = slots.len(), "swept idle entity slots");
        }
        removed
    }
}
