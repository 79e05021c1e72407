//! Housekeeping
//!
//! Periodic task that evicts aged entries and saves the store, each only
//! when the store's last-modified marker moved since that action last ran.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{CachePersistence, WorkStore};
use crate::error::{Error, Result};

/// Configuration for the housekeeping loop
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// Time between ticks
    pub interval: Duration,

    /// Age limit for entries; 0 disables eviction
    pub max_cache_age_days: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_cache_age_days: 0,
        }
    }
}

/// What a single tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Entries evicted, if a sweep ran
    pub swept: Option<usize>,
    /// Entries written, if a save succeeded
    pub saved: Option<usize>,
}

/// Sweep-and-save loop
pub struct Housekeeper {
    config: HousekeepingConfig,
    store: Arc<WorkStore>,
    persistence: CachePersistence,
    /// Marker seen at the last sweep; `None` until the first one
    swept_at: Option<u64>,
    saved_at: u64,
}

impl Housekeeper {
    /// The current store contents count as already saved
    pub fn new(
        config: HousekeepingConfig,
        store: Arc<WorkStore>,
        persistence: CachePersistence,
    ) -> Self {
        let saved_at = store.last_modified();
        Self {
            config,
            store,
            persistence,
            swept_at: None,
            saved_at,
        }
    }

    /// Run until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_cache_age_days = self.config.max_cache_age_days,
            persist = self.persistence.is_enabled(),
            "Starting housekeeping"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("Housekeeping stopped");
                    break;
                }
            }
        }
    }

    /// One sweep-then-save pass
    pub async fn tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        let marker = self.store.last_modified();
        if self.config.max_cache_age_days > 0 && self.swept_at != Some(marker) {
            let removed = self.store.remove_older_than(self.config.max_cache_age_days);
            if removed > 0 {
                info!(removed, remaining = self.store.len(), "Evicted aged cache entries");
            }
            self.swept_at = Some(self.store.last_modified());
            outcome.swept = Some(removed);
        }

        let marker = self.store.last_modified();
        if self.persistence.is_enabled() && marker != self.saved_at {
            match save_blocking(self.persistence.clone(), self.store.clone()).await {
                Ok(written) => {
                    self.saved_at = marker;
                    outcome.saved = Some(written);
                }
                // Marker stays put so the next tick retries
                Err(e) => error!("Failed to save work cache: {}", e),
            }
        }

        outcome
    }
}

/// Save off the async runtime
pub async fn save_blocking(persistence: CachePersistence, store: Arc<WorkStore>) -> Result<usize> {
    tokio::task::spawn_blocking(move || persistence.save(&store))
        .await
        .map_err(|e| Error::Internal(format!("save task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{unix_now, CacheEntry};
    use crate::domain::{Difficulty, UpstreamWork};
    use std::path::PathBuf;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("work-cache-hk-{}.txt", uuid::Uuid::new_v4()))
    }

    fn entry(hash: &str, time_added: u64) -> CacheEntry {
        CacheEntry::valid(
            UpstreamWork {
                hash: hash.to_string(),
                work: "deadbeef00000001".to_string(),
                difficulty: Difficulty(0xffffffc000000000),
                multiplier: 1.0,
            },
            None,
            time_added,
            time_added,
        )
    }

    #[tokio::test]
    async fn test_idle_store_is_not_saved() {
        let path = temp_path();
        let store = Arc::new(WorkStore::new());
        store.put(entry("A", unix_now()));
        let mut keeper = Housekeeper::new(
            HousekeepingConfig::default(),
            store.clone(),
            CachePersistence::new(Some(path.clone())),
        );

        assert_eq!(keeper.tick().await, TickOutcome::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_save_only_after_change() {
        let path = temp_path();
        let store = Arc::new(WorkStore::new());
        let mut keeper = Housekeeper::new(
            HousekeepingConfig::default(),
            store.clone(),
            CachePersistence::new(Some(path.clone())),
        );

        store.put(entry("A", unix_now()));
        assert_eq!(keeper.tick().await.saved, Some(1));
        assert!(path.exists());
        assert_eq!(keeper.tick().await.saved, None);

        store.put(entry("B", unix_now()));
        assert_eq!(keeper.tick().await.saved, Some(2));

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(CachePersistence::backup_path(&path));
    }

    #[tokio::test]
    async fn test_sweep_runs_first_tick_then_on_change() {
        let store = Arc::new(WorkStore::new());
        store.put(entry("old", 1));
        store.put(entry("new", unix_now()));
        let mut keeper = Housekeeper::new(
            HousekeepingConfig {
                max_cache_age_days: 1,
                ..Default::default()
            },
            store.clone(),
            CachePersistence::disabled(),
        );

        assert_eq!(keeper.tick().await.swept, Some(1));
        assert!(!store.contains("old"));
        assert_eq!(keeper.tick().await.swept, None);

        store.put(entry("old2", 1));
        assert_eq!(keeper.tick().await.swept, Some(1));
    }

    #[tokio::test]
    async fn test_zero_age_disables_sweep() {
        let store = Arc::new(WorkStore::new());
        store.put(entry("old", 1));
        let mut keeper = Housekeeper::new(
            HousekeepingConfig::default(),
            store.clone(),
            CachePersistence::disabled(),
        );
        assert_eq!(keeper.tick().await.swept, None);
        assert!(store.contains("old"));
    }

    #[tokio::test]
    async fn test_failed_save_is_retried() {
        let dir = std::env::temp_dir().join(format!("work-cache-missing-{}", uuid::Uuid::new_v4()));
        let path = dir.join("cache.txt");
        let store = Arc::new(WorkStore::new());
        let mut keeper = Housekeeper::new(
            HousekeepingConfig::default(),
            store.clone(),
            CachePersistence::new(Some(path.clone())),
        );

        store.put(entry("A", unix_now()));
        assert_eq!(keeper.tick().await.saved, None);

        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(keeper.tick().await.saved, Some(1));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
