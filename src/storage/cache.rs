//! Bounded in-memory cache of entity documents for one namespace.
//!
//! The cache is bounded by entry count and evicts by full reset: when a new
//! document would push it past its ceiling, every entry is dropped at once
//! under the write lock. There is no LRU bookkeeping on the read path.
//!
//! Entries written without write-through are dirty, and an entry stays dirty
//! until a flush of its latest generation lands. A reset never silently
//! discards dirty entries: they come back as a [`RescueBatch`] that holds the
//! disk gate exclusively. Loads and flushes pass through the gate shared, so
//! nobody reads a copy older than a rescued document while it is being
//! persisted, and the map lock itself is released before the rescue writes.
//!
//! Every reset or clear advances the cache epoch. A load that started in an
//! older epoch may have read disk before an evicted writer's copy landed, so
//! [`BoundedCache::insert`] rejects it as [`Admission::Stale`]. A flush from
//! an older epoch is dropped because the reset rescued a copy at least as new.

use crate::core::{Document, EntityKey, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug)]
struct CacheEntry {
    document: Document,
    dirty: bool,
    /// Bumped on every write; lets a flush tell whether it persisted the latest copy.
    generation: u64,
    /// Flushes that copied this entry and have not reported back yet.
    flushing: u32,
}

impl CacheEntry {
    fn needs_rescue(&self) -> bool {
        self.dirty || self.flushing > 0
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub ceiling: usize,
    pub hits: u64,
    pub misses: u64,
    pub resets: u64,
    pub rescued_dirty: u64,
}

/// Outcome of offering a loaded document to the cache.
#[derive(Debug)]
pub enum Admission<'a> {
    /// Inserted; carries the dirty documents of the reset it triggered, if any.
    Inserted(Option<RescueBatch<'a>>),
    /// Another worker loaded the key first; its copy stays.
    Resident,
    /// The cache was reset since the load began; load again.
    Stale,
}

/// Dirty documents dropped by a reset. Loads and flushes of the namespace
/// wait until the batch is dropped.
pub struct RescueBatch<'a> {
    documents: Vec<(EntityKey, Document)>,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl RescueBatch<'_> {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Hands the documents to `persist`; the gate opens once it returns.
    pub fn persist_with<R>(self, persist: impl FnOnce(Vec<(EntityKey, Document)>) -> R) -> R {
        persist(self.documents)
    }
}

impl std::fmt::Debug for RescueBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RescueBatch")
            .field("documents", &self.documents.len())
            .finish()
    }
}

/// A copy of a resident document on its way to disk.
#[derive(Debug)]
pub struct PendingFlush {
    pub key: EntityKey,
    pub document: Document,
    generation: u64,
    epoch: u64,
}

pub struct BoundedCache {
    ceiling: usize,
    entries: RwLock<HashMap<EntityKey, CacheEntry>>,
    disk_gate: RwLock<()>,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    resets: AtomicU64,
    rescued_dirty: AtomicU64,
}

impl BoundedCache {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            entries: RwLock::new(HashMap::new()),
            disk_gate: RwLock::new(()),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            rescued_dirty: AtomicU64::new(0),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Checks residency and records a hit or a miss.
    pub fn lookup(&self, key: &EntityKey) -> Result<bool> {
        let present = self.entries.read()?.contains_key(key);
        let counter = if present { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(present)
    }

    /// Runs `f` against a resident document. `Ok(None)` if `key` is not cached.
    pub fn read<R>(&self, key: &EntityKey, f: impl FnOnce(&Document) -> R) -> Result<Option<R>> {
        let entries = self.entries.read()?;
        Ok(entries.get(key).map(|entry| f(&entry.document)))
    }

    /// Runs `f` against a resident document and marks it dirty.
    /// `Ok(None)` if `key` is not cached.
    pub fn write<R>(
        &self,
        key: &EntityKey,
        f: impl FnOnce(&mut Document) -> R,
    ) -> Result<Option<R>> {
        let mut entries = self.entries.write()?;
        Ok(entries.get_mut(key).map(|entry| {
            entry.dirty = true;
            entry.generation += 1;
            f(&mut entry.document)
        }))
    }

    /// Current reset epoch. Read under the map lock, so a reset is either
    /// fully visible (its batch already holds the gate) or not at all.
    pub fn epoch(&self) -> Result<u64> {
        let _entries = self.entries.read()?;
        Ok(self.epoch.load(Ordering::Acquire))
    }

    /// Shared pass through the disk gate. Hold it while reading a document
    /// from disk; it waits while a reset's rescued documents are in flight.
    pub fn disk_gate(&self) -> Result<RwLockReadGuard<'_, ()>> {
        Ok(self.disk_gate.read()?)
    }

    /// Offers a document loaded from disk during `loaded_in` (see [`epoch`](Self::epoch)).
    ///
    /// If another worker populated the same key first, the resident copy wins
    /// (it may already carry newer writes). If the insert would exceed the
    /// ceiling the whole map is reset first.
    pub fn insert(&self, key: EntityKey, document: Document, loaded_in: u64) -> Result<Admission<'_>> {
        let mut entries = self.entries.write()?;
        if self.epoch.load(Ordering::Acquire) != loaded_in {
            return Ok(Admission::Stale);
        }
        if entries.contains_key(&key) {
            return Ok(Admission::Resident);
        }

        let mut rescued = None;
        if entries.len() >= self.ceiling {
            let batch = self.reset(&mut entries)?;
            self.resets.fetch_add(1, Ordering::Relaxed);
            debug!(
                sector = "cache",
                ceiling = self.ceiling,
                rescued = batch.as_ref().map(RescueBatch::len).unwrap_or(0),
                "cache ceiling reached, resetting"
            );
            rescued = batch;
        }

        entries.insert(
            key,
            CacheEntry {
                document,
                dirty: false,
                generation: 0,
                flushing: 0,
            },
        );
        Ok(Admission::Inserted(rescued))
    }

    /// Copies a resident document for persistence. The entry stays dirty
    /// until [`finish_flush`](Self::finish_flush) reports the copy landed.
    pub fn begin_flush(&self, key: &EntityKey) -> Result<Option<PendingFlush>> {
        let mut entries = self.entries.write()?;
        let epoch = self.epoch.load(Ordering::Acquire);
        Ok(entries
            .get_mut(key)
            .map(|entry| pending_flush(key, entry, epoch)))
    }

    /// [`begin_flush`](Self::begin_flush) for every dirty entry.
    pub fn begin_flush_dirty(&self) -> Result<Vec<PendingFlush>> {
        let mut entries = self.entries.write()?;
        let epoch = self.epoch.load(Ordering::Acquire);
        Ok(entries
            .iter_mut()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| pending_flush(key, entry, epoch))
            .collect())
    }

    /// Shared pass through the disk gate for writing `pending`. `None` when a
    /// reset has happened since the copy was taken; that reset rescued the
    /// entry, so this copy must not land after it.
    pub fn admit_flush(&self, pending: &PendingFlush) -> Result<Option<RwLockReadGuard<'_, ()>>> {
        let gate = self.disk_gate.read()?;
        if self.epoch.load(Ordering::Acquire) != pending.epoch {
            return Ok(None);
        }
        Ok(Some(gate))
    }

    /// Reports the outcome of a flush. Returns `true` when a newer generation
    /// was written meanwhile and still has to be persisted.
    pub fn finish_flush(&self, pending: &PendingFlush, persisted: bool) -> Result<bool> {
        let mut entries = self.entries.write()?;
        if self.epoch.load(Ordering::Acquire) != pending.epoch {
            return Ok(false);
        }
        let Some(entry) = entries.get_mut(&pending.key) else {
            return Ok(false);
        };
        entry.flushing = entry.flushing.saturating_sub(1);
        if !persisted {
            entry.dirty = true;
            return Ok(false);
        }
        if entry.generation > pending.generation {
            return Ok(true);
        }
        if entry.flushing == 0 {
            entry.dirty = false;
        }
        Ok(false)
    }

    pub fn is_dirty(&self, key: &EntityKey) -> Result<bool> {
        Ok(self
            .entries
            .read()?
            .get(key)
            .map(|entry| entry.dirty)
            .unwrap_or(false))
    }

    /// Drops every entry. Dirty ones come back as a batch to persist.
    pub fn clear(&self) -> Result<Option<RescueBatch<'_>>> {
        let mut entries = self.entries.write()?;
        self.reset(&mut entries)
    }

    /// Empties the map and advances the epoch. Takes the gate before the map
    /// lock is released when there is anything to rescue.
    fn reset(
        &self,
        entries: &mut HashMap<EntityKey, CacheEntry>,
    ) -> Result<Option<RescueBatch<'_>>> {
        let documents: Vec<_> = entries
            .drain()
            .filter(|(_, entry)| entry.needs_rescue())
            .map(|(key, entry)| (key, entry.document))
            .collect();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if documents.is_empty() {
            return Ok(None);
        }
        self.rescued_dirty
            .fetch_add(documents.len() as u64, Ordering::Relaxed);
        Ok(Some(RescueBatch {
            documents,
            _gate: self.disk_gate.write()?,
        }))
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .read()
            .map(|entries| entries.len())
            .unwrap_or_default();
        CacheStats {
            entries,
            ceiling: self.ceiling,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            rescued_dirty: self.rescued_dirty.load(Ordering::Relaxed),
        }
    }
}

fn pending_flush(key: &EntityKey, entry: &mut CacheEntry, epoch: u64) -> PendingFlush {
    entry.flushing += 1;
    PendingFlush {
        key: key.clone(),
        document: entry.document.clone(),
        generation: entry.generation,
        epoch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Platform;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn key(id: &str) -> EntityKey {
        EntityKey::new(Platform::Twitch, id)
    }

    fn admit<'a>(cache: &'a BoundedCache, id: &str) -> Admission<'a> {
        let epoch = cache.epoch().unwrap();
        cache.insert(key(id), Document::new(), epoch).unwrap()
    }

    #[test]
    fn test_read_write_resident() {
        let cache = BoundedCache::new(4);
        assert_eq!(cache.read(&key("a"), |doc| doc.len()).unwrap(), None);

        admit(&cache, "a");
        cache
            .write(&key("a"), |doc| doc.insert("x", json!(1)))
            .unwrap();

        assert_eq!(cache.read(&key("a"), |doc| doc.get_as::<i64>("x").unwrap()).unwrap(), Some(Some(1)));
        assert!(cache.is_dirty(&key("a")).unwrap());
    }

    #[test]
    fn test_reset_when_ceiling_reached() {
        let cache = BoundedCache::new(2);
        admit(&cache, "a");
        admit(&cache, "b");
        cache.write(&key("b"), |doc| doc.insert("x", json!(1))).unwrap();

        let Admission::Inserted(Some(batch)) = admit(&cache, "c") else {
            panic!("expected a reset with rescued documents");
        };
        let rescued = batch.persist_with(|documents| documents);

        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(rescued.len(), 1);
        assert_eq!(rescued[0].0, key("b"));
        assert_eq!(cache.stats().resets, 1);
        assert_eq!(cache.stats().rescued_dirty, 1);
    }

    #[test]
    fn test_clean_reset_has_nothing_to_rescue() {
        let cache = BoundedCache::new(1);
        admit(&cache, "a");
        assert!(matches!(admit(&cache, "b"), Admission::Inserted(None)));
        assert!(cache.clear().unwrap().is_none());
    }

    #[test]
    fn test_insert_keeps_resident_copy() {
        let cache = BoundedCache::new(4);
        admit(&cache, "a");
        cache.write(&key("a"), |doc| doc.insert("x", json!(5))).unwrap();

        assert!(matches!(admit(&cache, "a"), Admission::Resident));
        assert_eq!(cache.read(&key("a"), |doc| doc.get_as::<i64>("x").unwrap()).unwrap(), Some(Some(5)));
    }

    #[test]
    fn test_load_from_before_reset_is_stale() {
        let cache = BoundedCache::new(4);
        let loaded_in = cache.epoch().unwrap();

        // Another worker evicts everything while this load reads disk.
        assert!(cache.clear().unwrap().is_none());
        assert_ne!(cache.epoch().unwrap(), loaded_in);

        let admission = cache.insert(key("a"), Document::new(), loaded_in).unwrap();
        assert!(matches!(admission, Admission::Stale));
        assert!(!cache.lookup(&key("a")).unwrap());
    }

    #[test]
    fn test_ceiling_reset_advances_epoch() {
        let cache = BoundedCache::new(1);
        admit(&cache, "a");
        let before = cache.epoch().unwrap();
        admit(&cache, "b");
        assert_eq!(cache.epoch().unwrap(), before + 1);
    }

    #[test]
    fn test_disk_gate_holds_loaders_until_persisted() {
        let cache = BoundedCache::new(4);
        admit(&cache, "a");
        cache.write(&key("a"), |doc| doc.insert("x", json!(1))).unwrap();

        let batch = cache.clear().unwrap().expect("dirty document rescued");
        let passed = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let loader = scope.spawn(|| {
                let _gate = cache.disk_gate().unwrap();
                passed.store(true, Ordering::SeqCst);
            });

            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!passed.load(Ordering::SeqCst));
            // The map itself is usable while the batch is outstanding.
            assert!(cache.is_empty().unwrap());

            assert_eq!(batch.persist_with(|documents| documents.len()), 1);
            loader.join().unwrap();
        });

        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_entry_stays_dirty_until_flush_lands() {
        let cache = BoundedCache::new(4);
        admit(&cache, "a");
        cache.write(&key("a"), |doc| doc.insert("x", json!(1))).unwrap();

        let pending = cache.begin_flush(&key("a")).unwrap().unwrap();
        assert_eq!(pending.document.get_as::<i64>("x").unwrap(), Some(1));
        assert!(cache.is_dirty(&key("a")).unwrap());

        assert!(!cache.finish_flush(&pending, true).unwrap());
        assert!(!cache.is_dirty(&key("a")).unwrap());
        assert!(cache.begin_flush_dirty().unwrap().is_empty());
    }

    #[test]
    fn test_newer_write_during_flush_is_reported() {
        let cache = BoundedCache::new(4);
        admit(&cache, "a");
        cache.write(&key("a"), |doc| doc.insert("x", json!(1))).unwrap();

        let pending = cache.begin_flush(&key("a")).unwrap().unwrap();
        cache.write(&key("a"), |doc| doc.insert("x", json!(2))).unwrap();

        assert!(cache.finish_flush(&pending, true).unwrap());
        assert!(cache.is_dirty(&key("a")).unwrap());
    }

    #[test]
    fn test_failed_flush_leaves_entry_dirty() {
        let cache = BoundedCache::new(4);
        admit(&cache, "a");

        let pending = cache.begin_flush(&key("a")).unwrap().unwrap();
        assert!(!cache.finish_flush(&pending, false).unwrap());
        assert!(cache.is_dirty(&key("a")).unwrap());
    }

    #[test]
    fn test_reset_rescues_in_flight_flush_and_drops_it() {
        let cache = BoundedCache::new(4);
        admit(&cache, "a");
        cache.write(&key("a"), |doc| doc.insert("x", json!(1))).unwrap();
        let pending = cache.begin_flush(&key("a")).unwrap().unwrap();

        let batch = cache.clear().unwrap().expect("in-flight entry rescued");
        let rescued = batch.persist_with(|documents| documents);
        assert_eq!(rescued[0].0, key("a"));

        assert!(cache.admit_flush(&pending).unwrap().is_none());
        assert!(!cache.finish_flush(&pending, true).unwrap());
    }

    #[test]
    fn test_lookup_counts_hits_and_misses() {
        let cache = BoundedCache::new(4);
        assert!(!cache.lookup(&key("a")).unwrap());
        admit(&cache, "a");
        assert!(cache.lookup(&key("a")).unwrap());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }
}
