//! Namespace-parameterized entity store.
//!
//! One [`EntityStore`] owns one namespace (`users`, `bank`, `channels`, ...):
//! its on-disk root, its layout and its [`BoundedCache`]. Reads are
//! cache-first; a miss loads the whole document from disk. Writes go into the
//! cached document and, unless deferred, the whole document is re-encoded and
//! atomically replaced on disk.
//!
//! The public surface never fails. Decode, I/O and type errors are logged and
//! degrade to "attribute not set": `get` yields the default, `contains`
//! yields `false`, writes are skipped. The store does not serialize callers;
//! a read-modify-write on one entity must run under that entity's slot in the
//! [`InteractionSerializer`](crate::serializer::InteractionSerializer).

use crate::config::{NamespaceConfig, ReadDefaultPolicy};
use crate::core::{Document, EntityKey, Result, StateError};
use crate::storage::cache::{Admission, BoundedCache, CacheStats, PendingFlush};
use crate::storage::{codec, layout};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

/// A load can be overtaken by a cache reset, and a freshly loaded entry can be
/// reset away before we touch it; retry the load this many times.
const MAX_RESIDENCY_ATTEMPTS: usize = 3;

/// Re-flushes allowed when concurrent updaters keep replacing the document.
const MAX_FLUSH_PASSES: usize = 3;

pub struct EntityStore {
    namespace: NamespaceConfig,
    cache: BoundedCache,
}

impl EntityStore {
    pub fn new(namespace: NamespaceConfig) -> Self {
        let cache = BoundedCache::new(namespace.cache_ceiling);
        Self { namespace, cache }
    }

    pub fn namespace(&self) -> &NamespaceConfig {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.namespace.name
    }

    /// Per-entity view that saves repeating the key on every call.
    pub fn entity(&self, key: &EntityKey) -> EntityHandle<'_> {
        EntityHandle {
            store: self,
            key: key.clone(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ------------------------------------------------------------------
    // Public, non-failing surface
    // ------------------------------------------------------------------

    /// Reads `attr` as `T`. An absent attribute is created with `T::default()`
    /// (in the cache, and on disk when the namespace writes read defaults
    /// through) and that default is returned.
    pub fn get<T>(&self, key: &EntityKey, attr: &str) -> T
    where
        T: DeserializeOwned + Serialize + Default,
    {
        self.try_get(key, attr).unwrap_or_else(|err| {
            self.report("get", key, Some(attr), &err);
            T::default()
        })
    }

    /// Reads `attr` without creating it. `None` when absent or unreadable.
    pub fn peek<T: DeserializeOwned>(&self, key: &EntityKey, attr: &str) -> Option<T> {
        self.try_peek(key, attr).unwrap_or_else(|err| {
            self.report("peek", key, Some(attr), &err);
            None
        })
    }

    pub fn contains(&self, key: &EntityKey, attr: &str) -> bool {
        self.try_contains(key, attr).unwrap_or_else(|err| {
            self.report("contains", key, Some(attr), &err);
            false
        })
    }

    /// Writes `attr` and persists the whole document.
    pub fn save<T: Serialize>(&self, key: &EntityKey, attr: &str, value: T) {
        if let Err(err) = self.try_save(key, attr, value, true) {
            self.report("save", key, Some(attr), &err);
        }
    }

    /// Writes `attr` into the cached document only. The change reaches disk on
    /// the next [`flush`](Self::flush), write-through save, or `flush_all`.
    pub fn save_deferred<T: Serialize>(&self, key: &EntityKey, attr: &str, value: T) {
        if let Err(err) = self.try_save(key, attr, value, false) {
            self.report("save_deferred", key, Some(attr), &err);
        }
    }

    /// Writes `attr` only if it is absent. Returns whether a write happened.
    pub fn set_if_missing<T: Serialize>(
        &self,
        key: &EntityKey,
        attr: &str,
        value: T,
        write_through: bool,
    ) -> bool {
        self.try_set_if_missing(key, attr, value, write_through)
            .unwrap_or_else(|err| {
                self.report("set_if_missing", key, Some(attr), &err);
                false
            })
    }

    /// Atomically reads, decides and writes one attribute.
    ///
    /// `f` receives the current value (`None` if absent or not a `T`) and
    /// returns the value to store (`None` leaves the attribute untouched) plus
    /// a result. The decision runs under the cache write lock, so concurrent
    /// updaters of the same attribute cannot lose each other's writes even
    /// without holding the entity slot. The document is then persisted.
    ///
    /// On store failure `f` is evaluated against `None`, its write is dropped
    /// and its result returned.
    pub fn update<T, R, F>(&self, key: &EntityKey, attr: &str, mut f: F) -> R
    where
        T: DeserializeOwned + Serialize,
        F: FnMut(Option<T>) -> (Option<T>, R),
    {
        match self.try_update(key, attr, &mut f) {
            Ok(result) => result,
            Err(err) => {
                self.report("update", key, Some(attr), &err);
                f(None).1
            }
        }
    }

    /// Deletes one attribute and persists. Returns whether it existed.
    pub fn remove(&self, key: &EntityKey, attr: &str) -> bool {
        self.try_remove(key, attr).unwrap_or_else(|err| {
            self.report("remove", key, Some(attr), &err);
            false
        })
    }

    /// Re-encodes and persists the cached document unconditionally.
    pub fn flush(&self, key: &EntityKey) {
        if let Err(err) = self.try_flush(key) {
            self.report("flush", key, None, &err);
        }
    }

    /// Persists every dirty document. Returns how many were written.
    pub fn flush_all(&self) -> usize {
        match self.cache.begin_flush_dirty() {
            Ok(pending) => pending
                .into_iter()
                .filter(|pending| match self.flush_pending(pending) {
                    Ok(_) => true,
                    Err(err) => {
                        self.report("flush_all", &pending.key, None, &err);
                        false
                    }
                })
                .count(),
            Err(err) => {
                error!(sector = "store", namespace = %self.namespace.name, error = %err, "flush_all failed");
                0
            }
        }
    }

    /// Clone of the whole document (empty if unreadable).
    pub fn document(&self, key: &EntityKey) -> Document {
        self.with_resident(key, |doc| doc.clone())
            .unwrap_or_else(|err| {
                self.report("document", key, None, &err);
                Document::new()
            })
    }

    /// Drops every cache entry and persists the dirty ones. Subsequent reads
    /// come from disk, exactly as after a process restart.
    pub fn reset_cache(&self) -> usize {
        match self.cache.clear() {
            Ok(batch) => batch.map_or(0, |batch| batch.persist_with(|dirty| self.persist_batch(dirty))),
            Err(err) => {
                error!(sector = "store", namespace = %self.namespace.name, error = %err, "cache reset failed");
                0
            }
        }
    }

    // ------------------------------------------------------------------
    // Fallible internals
    // ------------------------------------------------------------------

    pub fn try_get<T>(&self, key: &EntityKey, attr: &str) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if let Some(value) = self.with_resident(key, |doc| doc.get_as::<T>(attr))?? {
            return Ok(value);
        }

        let default = T::default();
        let encoded = to_attribute_value(attr, &default)?;
        self.with_resident_mut(key, |doc| {
            if !doc.contains(attr) {
                doc.insert(attr, encoded.clone());
            }
        })?;
        if self.namespace.read_default_policy == ReadDefaultPolicy::WriteThrough {
            self.try_flush(key)?;
        }
        Ok(default)
    }

    pub fn try_peek<T: DeserializeOwned>(&self, key: &EntityKey, attr: &str) -> Result<Option<T>> {
        self.with_resident(key, |doc| doc.get_as::<T>(attr))?
    }

    pub fn try_contains(&self, key: &EntityKey, attr: &str) -> Result<bool> {
        self.with_resident(key, |doc| doc.contains(attr))
    }

    pub fn try_save<T: Serialize>(
        &self,
        key: &EntityKey,
        attr: &str,
        value: T,
        write_through: bool,
    ) -> Result<()> {
        let encoded = to_attribute_value(attr, &value)?;
        self.with_resident_mut(key, |doc| {
            doc.insert(attr, encoded.clone());
        })?;
        if write_through {
            self.try_flush(key)?;
        }
        Ok(())
    }

    pub fn try_set_if_missing<T: Serialize>(
        &self,
        key: &EntityKey,
        attr: &str,
        value: T,
        write_through: bool,
    ) -> Result<bool> {
        if self.try_contains(key, attr)? {
            return Ok(false);
        }
        let encoded = to_attribute_value(attr, &value)?;
        let written = self.with_resident_mut(key, |doc| {
            if doc.contains(attr) {
                false
            } else {
                doc.insert(attr, encoded.clone());
                true
            }
        })?;
        if written && write_through {
            self.try_flush(key)?;
        }
        Ok(written)
    }

    pub fn try_update<T, R, F>(&self, key: &EntityKey, attr: &str, f: &mut F) -> Result<R>
    where
        T: DeserializeOwned + Serialize,
        F: FnMut(Option<T>) -> (Option<T>, R),
    {
        let result = self.with_resident_mut(key, |doc| {
            let current = match doc.get_as::<T>(attr) {
                Ok(current) => current,
                Err(err) => {
                    warn!(sector = "store", namespace = %self.namespace.name, entity = %key, attribute = attr, error = %err, "treating unreadable attribute as absent");
                    None
                }
            };
            let (next, result) = f(current);
            let next = next.map(|value| to_attribute_value(attr, &value)).transpose()?;
            if let Some(next) = next {
                doc.insert(attr, next);
            }
            Ok::<R, StateError>(result)
        })??;
        self.try_flush(key)?;
        Ok(result)
    }

    pub fn try_remove(&self, key: &EntityKey, attr: &str) -> Result<bool> {
        let existed = self.with_resident_mut(key, |doc| doc.remove(attr).is_some())?;
        if existed {
            self.try_flush(key)?;
        }
        Ok(existed)
    }

    pub fn try_flush(&self, key: &EntityKey) -> Result<()> {
        for _ in 0..MAX_FLUSH_PASSES {
            let Some(pending) = self.cache.begin_flush(key)? else {
                return Ok(());
            };
            // A writer that does not hold the entity slot (channel `update`)
            // may have landed a newer copy before ours; write again if so.
            if !self.flush_pending(&pending)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Writes one pending copy unless a reset has already rescued it, then
    /// reports back to the cache. Returns whether a newer generation still
    /// waits to be persisted.
    fn flush_pending(&self, pending: &PendingFlush) -> Result<bool> {
        let persisted = match self.cache.admit_flush(pending)? {
            Some(gate) => {
                let persisted = self.persist(&pending.key, &pending.document);
                drop(gate);
                persisted
            }
            None => Ok(()),
        };
        let newer = self.cache.finish_flush(pending, persisted.is_ok())?;
        persisted.map(|()| newer)
    }

    fn persist(&self, key: &EntityKey, document: &Document) -> Result<()> {
        let path = layout::document_path(&self.namespace, key)?;
        let bytes = codec::encode(document)?;
        layout::atomic_write(&path, &bytes)
    }

    fn persist_batch(&self, documents: Vec<(EntityKey, Document)>) -> usize {
        let mut written = 0;
        for (key, document) in documents {
            match self.persist(&key, &document) {
                Ok(()) => written += 1,
                Err(err) => self.report("persist", &key, None, &err),
            }
        }
        written
    }

    /// Makes sure `key`'s document is cached, loading it from disk on a miss.
    /// A load overtaken by a cache reset is discarded; the residency retry in
    /// the caller loads again.
    fn ensure_loaded(&self, key: &EntityKey) -> Result<()> {
        if self.cache.lookup(key)? {
            return Ok(());
        }

        let epoch = self.cache.epoch()?;
        let path = layout::document_path(&self.namespace, key)?;
        let document = {
            let _gate = self.cache.disk_gate()?;
            match layout::read_file(&path)? {
                None => Document::new(),
                Some(bytes) => match codec::decode(&bytes) {
                    Ok(document) => document,
                    Err(err) => {
                        warn!(sector = "store", namespace = %self.namespace.name, entity = %key, path = %path.display(), error = %err, "corrupt document, continuing with an empty one");
                        if let Err(err) = layout::quarantine(&path) {
                            error!(sector = "store", namespace = %self.namespace.name, entity = %key, error = %err, "failed to quarantine corrupt document");
                        }
                        Document::new()
                    }
                },
            }
        };

        match self.cache.insert(key.clone(), document, epoch)? {
            Admission::Inserted(Some(batch)) => {
                batch.persist_with(|rescued| self.persist_batch(rescued));
            }
            Admission::Stale => {
                debug!(sector = "store", namespace = %self.namespace.name, entity = %key, "cache reset during load, reloading");
            }
            Admission::Inserted(None) | Admission::Resident => {}
        }
        Ok(())
    }

    fn with_resident<R>(&self, key: &EntityKey, mut f: impl FnMut(&Document) -> R) -> Result<R> {
        for _ in 0..MAX_RESIDENCY_ATTEMPTS {
            self.ensure_loaded(key)?;
            if let Some(result) = self.cache.read(key, &mut f)? {
                return Ok(result);
            }
        }
        Err(residency_error(key))
    }

    fn with_resident_mut<R>(
        &self,
        key: &EntityKey,
        mut f: impl FnMut(&mut Document) -> R,
    ) -> Result<R> {
        for _ in 0..MAX_RESIDENCY_ATTEMPTS {
            self.ensure_loaded(key)?;
            if let Some(result) = self.cache.write(key, &mut f)? {
                return Ok(result);
            }
        }
        Err(residency_error(key))
    }

    fn report(&self, op: &str, key: &EntityKey, attr: Option<&str>, err: &StateError) {
        let attr = attr.unwrap_or("-");
        match err {
            StateError::IoError(_) | StateError::LockError(_) => error!(
                sector = "store",
                namespace = %self.namespace.name,
                platform = %key.platform,
                entity = %key.id,
                attribute = attr,
                op,
                error = %err,
                "store operation failed"
            ),
            _ => warn!(
                sector = "store",
                namespace = %self.namespace.name,
                platform = %key.platform,
                entity = %key.id,
                attribute = attr,
                op,
                error = %err,
                "store operation degraded to default"
            ),
        }
    }
}

fn to_attribute_value<T: Serialize>(attr: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| {
        StateError::TypeMismatch(format!("attribute '{}' is not serializable: {}", attr, err))
    })
}

fn residency_error(key: &EntityKey) -> StateError {
    StateError::LockError(format!(
        "document for {} was evicted {} times while loading",
        key, MAX_RESIDENCY_ATTEMPTS
    ))
}

/// One entity within one [`EntityStore`].
#[derive(Clone)]
pub struct EntityHandle<'a> {
    store: &'a EntityStore,
    key: EntityKey,
}

impl<'a> EntityHandle<'a> {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn store(&self) -> &'a EntityStore {
        self.store
    }

    pub fn get<T: DeserializeOwned + Serialize + Default>(&self, attr: &str) -> T {
        self.store.get(&self.key, attr)
    }

    pub fn peek<T: DeserializeOwned>(&self, attr: &str) -> Option<T> {
        self.store.peek(&self.key, attr)
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.store.contains(&self.key, attr)
    }

    pub fn save<T: Serialize>(&self, attr: &str, value: T) {
        self.store.save(&self.key, attr, value)
    }

    pub fn save_deferred<T: Serialize>(&self, attr: &str, value: T) {
        self.store.save_deferred(&self.key, attr, value)
    }

    pub fn set_if_missing<T: Serialize>(&self, attr: &str, value: T, write_through: bool) -> bool {
        self.store.set_if_missing(&self.key, attr, value, write_through)
    }

    pub fn update<T, R, F>(&self, attr: &str, f: F) -> R
    where
        T: DeserializeOwned + Serialize,
        F: FnMut(Option<T>) -> (Option<T>, R),
    {
        self.store.update(&self.key, attr, f)
    }

    pub fn remove(&self, attr: &str) -> bool {
        self.store.remove(&self.key, attr)
    }

    pub fn flush(&self) {
        self.store.flush(&self.key)
    }

    pub fn document(&self) -> Document {
        self.store.document(&self.key)
    }
}
