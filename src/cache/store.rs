//! Work Store
//!
//! Process-wide map from block hash to [`CacheEntry`]. Every mutation and
//! every full iteration takes the same lock, and every mutation advances a
//! monotonically increasing generation counter that housekeeping compares
//! against to decide whether a sweep or a save is due.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use super::entry::CacheEntry;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// In-memory work cache
#[derive(Debug, Default)]
pub struct WorkStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// Last-modified marker, bumped under the write lock
    generation: AtomicU64,
}

impl WorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.hash`.
    ///
    /// Entries without a hash are ignored; returns whether it was stored.
    pub fn put(&self, entry: CacheEntry) -> bool {
        if entry.hash.is_empty() {
            return false;
        }
        let mut entries = self.entries.write();
        entries.insert(entry.hash.clone(), entry);
        self.generation.fetch_add(1, Ordering::Release);
        true
    }

    pub fn get(&self, hash: &str) -> Option<CacheEntry> {
        self.entries.read().get(hash).cloned()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.read().contains_key(hash)
    }

    /// Insert a computing placeholder unless one is already present.
    ///
    /// Returns `false` when another request holds the hash.
    pub fn begin_computing(&self, entry: CacheEntry) -> bool {
        if entry.hash.is_empty() {
            return false;
        }
        let mut entries = self.entries.write();
        if entries.get(&entry.hash).is_some_and(CacheEntry::is_computing) {
            return false;
        }
        entries.insert(entry.hash.clone(), entry);
        self.generation.fetch_add(1, Ordering::Release);
        true
    }

    /// Drop the entry for `hash` only if it is still a computing placeholder
    pub fn remove_computing(&self, hash: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get(hash) {
            Some(entry) if entry.is_computing() => {
                entries.remove(hash);
                self.generation.fetch_add(1, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Remove entries older than `max_age_days`, measured from now
    pub fn remove_older_than(&self, max_age_days: u64) -> usize {
        self.remove_older_than_at(max_age_days, unix_now())
    }

    /// Remove entries whose age reference predates `now - max_age_days`.
    ///
    /// Valid entries age from `time_added`, computing ones from
    /// `time_started`.
    pub fn remove_older_than_at(&self, max_age_days: u64, now: u64) -> usize {
        let cutoff = now.saturating_sub(max_age_days.saturating_mul(SECONDS_PER_DAY));

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.age_reference() >= cutoff);
        let removed = before - entries.len();

        if removed > 0 {
            self.generation.fetch_add(1, Ordering::Release);
        }
        debug!(removed, cutoff, remaining = entries.len(), "Age sweep finished");
        removed
    }

    /// Consistent copy of all entries
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current value of the last-modified marker
    pub fn last_modified(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
