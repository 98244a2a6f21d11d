//! I define [`ClosureStatusCache`], an in-process cache of closure metadata records.
//!
//! The cache is advisory: the metadata file stays authoritative,
//! and an entry is only trusted for `ttl` after it was stored.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::trace;

use crate::status::ClosureMetadata;

/// A cache of [`ClosureMetadata`], keyed by the path of their metadata file.
///
/// Expired entries are evicted when they are looked up, or by [`ClosureStatusCache::purge`].
/// A zero `ttl` disables caching.
#[derive(Debug)]
pub struct ClosureStatusCache {
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, (ClosureMetadata, Instant)>>,
}

impl ClosureStatusCache {
    /// An empty cache whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        ClosureStatusCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// How long entries are kept
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The record cached for `key`, if any and not expired.
    pub fn get(&self, key: &Path) -> Option<ClosureMetadata> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some((record, stored)) if stored.elapsed() < self.ttl => Some(record.clone()),
            Some(_) => {
                trace!("closure status cache entry for {} expired", key.display());
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `record` for `key`, replacing any previous entry.
    pub fn put(&self, key: &Path, record: ClosureMetadata) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries()
            .insert(key.to_path_buf(), (record, Instant::now()));
    }

    /// Forget the entry of `key`.
    pub fn invalidate(&self, key: &Path) {
        self.entries().remove(key);
    }

    /// Evict all expired entries.
    pub fn purge(&self) {
        let ttl = self.ttl;
        self.entries().retain(|_, (_, stored)| stored.elapsed() < ttl);
    }

    /// Number of entries, including expired ones not evicted yet
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether this cache has no entry
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, (ClosureMetadata, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
