//! Difficulty Oracle
//!
//! Caches the network's current minimum difficulty for a fixed TTL. A failed
//! refresh keeps serving the last known value.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::domain::{Difficulty, WorkUpstream};

/// Network minimum used before the first successful refresh
pub const DEFAULT_DIFFICULTY: Difficulty = Difficulty(0xffffffc000000000);

/// Configuration for the difficulty oracle
#[derive(Debug, Clone)]
pub struct DifficultyConfig {
    /// How long a fetched value is served without asking the node again
    pub ttl: Duration,

    /// Value served until the node has answered once
    pub initial: Difficulty,
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            initial: DEFAULT_DIFFICULTY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedDifficulty {
    value: Difficulty,
    fetched_at: Option<Instant>,
}

/// TTL cache in front of `WorkUpstream::get_current_difficulty`
pub struct DifficultyOracle {
    config: DifficultyConfig,
    upstream: Arc<dyn WorkUpstream>,
    cached: RwLock<CachedDifficulty>,
    /// Serializes refreshes so an expiry triggers one node call
    refresh: Mutex<()>,
}

impl DifficultyOracle {
    pub fn new(config: DifficultyConfig, upstream: Arc<dyn WorkUpstream>) -> Self {
        let cached = CachedDifficulty {
            value: config.initial,
            fetched_at: None,
        };
        Self {
            config,
            upstream,
            cached: RwLock::new(cached),
            refresh: Mutex::new(()),
        }
    }

    /// Last known value, without refreshing
    pub fn cached(&self) -> Difficulty {
        self.cached.read().value
    }

    fn fresh_value(&self) -> Option<Difficulty> {
        let cached = *self.cached.read();
        match cached.fetched_at {
            Some(at) if at.elapsed() <= self.config.ttl && !cached.value.is_unspecified() => {
                Some(cached.value)
            }
            _ => None,
        }
    }

    /// Current difficulty, refreshing from the node if the TTL has expired
    #[instrument(skip(self))]
    pub async fn current(&self) -> Difficulty {
        if let Some(value) = self.fresh_value() {
            return value;
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(value) = self.fresh_value() {
            return value;
        }

        match self.upstream.get_current_difficulty().await {
            Ok(value) if !value.is_unspecified() => {
                debug!(difficulty = %value, "Network difficulty refreshed");
                *self.cached.write() = CachedDifficulty {
                    value,
                    fetched_at: Some(Instant::now()),
                };
                value
            }
            Ok(_) => {
                warn!("Node reported zero difficulty, keeping {}", self.cached());
                self.cached()
            }
            Err(e) => {
                warn!("Failed to refresh network difficulty, keeping {}: {}", self.cached(), e);
                self.cached()
            }
        }
    }
}

impl std::fmt::Debug for DifficultyOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifficultyOracle")
            .field("config", &self.config)
            .field("cached", &self.cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryUpstream;

    #[tokio::test(start_paused = true)]
    async fn test_initial_value_before_refresh() {
        let upstream = Arc::new(InMemoryUpstream::new());
        let oracle = DifficultyOracle::new(DifficultyConfig::default(), upstream);
        assert_eq!(oracle.cached(), DEFAULT_DIFFICULTY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_is_cached_within_ttl() {
        let upstream = Arc::new(InMemoryUpstream::new());
        upstream.set_difficulty(Difficulty(0xfffffff800000000));
        let oracle = DifficultyOracle::new(DifficultyConfig::default(), upstream.clone());

        assert_eq!(oracle.current().await, Difficulty(0xfffffff800000000));
        upstream.set_difficulty(Difficulty(0xfffffe0000000000));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(oracle.current().await, Difficulty(0xfffffff800000000));
        assert_eq!(upstream.difficulty_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_ttl() {
        let upstream = Arc::new(InMemoryUpstream::new());
        upstream.set_difficulty(Difficulty(0xfffffff800000000));
        let oracle = DifficultyOracle::new(DifficultyConfig::default(), upstream.clone());
        oracle.current().await;

        upstream.set_difficulty(Difficulty(0xfffffe0000000000));
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(oracle.current().await, Difficulty(0xfffffe0000000000));
        assert_eq!(upstream.difficulty_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_value() {
        let upstream = Arc::new(InMemoryUpstream::new());
        upstream.set_difficulty(Difficulty(0xfffffff800000000));
        let oracle = DifficultyOracle::new(DifficultyConfig::default(), upstream.clone());
        oracle.current().await;

        upstream.fail_difficulty(true);
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(oracle.current().await, Difficulty(0xfffffff800000000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_before_first_refresh_uses_floor() {
        let upstream = Arc::new(InMemoryUpstream::new());
        upstream.fail_difficulty(true);
        let oracle = DifficultyOracle::new(DifficultyConfig::default(), upstream);
        assert_eq!(oracle.current().await, DEFAULT_DIFFICULTY);
    }
}
