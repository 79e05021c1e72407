//! In-Memory Upstream
//!
//! Scripted implementation of the `WorkUpstream` port. Counts calls, can be
//! slowed down or made to fail, and derives work values deterministically
//! from the hash and the call sequence number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::{Difficulty, UpstreamWork, WorkUpstream};
use crate::engine::DEFAULT_DIFFICULTY;
use crate::error::{Error, Result};

/// Scripted node for tests and offline runs
#[derive(Debug)]
pub struct InMemoryUpstream {
    difficulty: RwLock<Difficulty>,
    frontiers: RwLock<HashMap<String, String>>,
    work_delay: RwLock<Duration>,
    frontier_delay: RwLock<Duration>,
    passthrough_reply: RwLock<String>,
    passthrough_bodies: RwLock<Vec<String>>,
    work_requests: RwLock<Vec<(String, Difficulty)>>,

    fail_work: AtomicBool,
    fail_difficulty: AtomicBool,
    omit_hash: AtomicBool,
    invalid_work: AtomicBool,

    work_calls: AtomicU64,
    frontier_calls: AtomicU64,
    frontiers_in_flight: AtomicU64,
    peak_frontiers_in_flight: AtomicU64,
    difficulty_calls: AtomicU64,
}

impl Default for InMemoryUpstream {
    fn default() -> Self {
        Self {
            difficulty: RwLock::new(DEFAULT_DIFFICULTY),
            frontiers: RwLock::new(HashMap::new()),
            work_delay: RwLock::new(Duration::ZERO),
            frontier_delay: RwLock::new(Duration::ZERO),
            passthrough_reply: RwLock::new("{}".to_string()),
            passthrough_bodies: RwLock::new(Vec::new()),
            work_requests: RwLock::new(Vec::new()),
            fail_work: AtomicBool::new(false),
            fail_difficulty: AtomicBool::new(false),
            omit_hash: AtomicBool::new(false),
            invalid_work: AtomicBool::new(false),
            work_calls: AtomicU64::new(0),
            frontier_calls: AtomicU64::new(0),
            frontiers_in_flight: AtomicU64::new(0),
            peak_frontiers_in_flight: AtomicU64::new(0),
            difficulty_calls: AtomicU64::new(0),
        }
    }
}

impl InMemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    // Scripting

    pub fn set_difficulty(&self, difficulty: Difficulty) {
        *self.difficulty.write() = difficulty;
    }

    pub fn set_frontier(&self, account: impl Into<String>, hash: impl Into<String>) {
        self.frontiers.write().insert(account.into(), hash.into());
    }

    /// Make every `compute_work` take this long
    pub fn set_work_delay(&self, delay: Duration) {
        *self.work_delay.write() = delay;
    }

    /// Make every `get_frontier` take this long
    pub fn set_frontier_delay(&self, delay: Duration) {
        *self.frontier_delay.write() = delay;
    }

    pub fn set_passthrough_reply(&self, reply: impl Into<String>) {
        *self.passthrough_reply.write() = reply.into();
    }

    pub fn fail_work(&self, fail: bool) {
        self.fail_work.store(fail, Ordering::SeqCst);
    }

    pub fn fail_difficulty(&self, fail: bool) {
        self.fail_difficulty.store(fail, Ordering::SeqCst);
    }

    /// Leave the hash field of work responses empty
    pub fn omit_hash(&self, omit: bool) {
        self.omit_hash.store(omit, Ordering::SeqCst);
    }

    /// Return a truncated work value
    pub fn invalid_work(&self, invalid: bool) {
        self.invalid_work.store(invalid, Ordering::SeqCst);
    }

    // Inspection

    pub fn work_calls(&self) -> u64 {
        self.work_calls.load(Ordering::SeqCst)
    }

    pub fn frontier_calls(&self) -> u64 {
        self.frontier_calls.load(Ordering::SeqCst)
    }

    /// Most `get_frontier` calls that were ever running at once
    pub fn peak_frontiers_in_flight(&self) -> u64 {
        self.peak_frontiers_in_flight.load(Ordering::SeqCst)
    }

    pub fn difficulty_calls(&self) -> u64 {
        self.difficulty_calls.load(Ordering::SeqCst)
    }

    /// `(hash, difficulty)` of every work call, in order
    pub fn work_requests(&self) -> Vec<(String, Difficulty)> {
        self.work_requests.read().clone()
    }

    pub fn passthrough_bodies(&self) -> Vec<String> {
        self.passthrough_bodies.read().clone()
    }

    fn work_value(hash: &str, sequence: u64) -> String {
        let digest = hash
            .bytes()
            .fold(0xcbf29ce484222325u64, |acc, b| (acc ^ b as u64).wrapping_mul(0x100000001b3));
        format!("{:08x}{:08x}", digest as u32, sequence as u32)
    }
}

#[async_trait]
impl WorkUpstream for InMemoryUpstream {
    async fn compute_work(&self, hash: &str, difficulty: Difficulty) -> Result<UpstreamWork> {
        let sequence = self.work_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.work_requests.write().push((hash.to_string(), difficulty));

        let delay = *self.work_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_work.load(Ordering::SeqCst) {
            return Err(Error::Upstream("work generation failed".to_string()));
        }

        let difficulty = if difficulty.is_unspecified() {
            *self.difficulty.read()
        } else {
            difficulty
        };
        let work = if self.invalid_work.load(Ordering::SeqCst) {
            "bad".to_string()
        } else {
            Self::work_value(hash, sequence)
        };
        let hash = if self.omit_hash.load(Ordering::SeqCst) {
            String::new()
        } else {
            hash.to_string()
        };

        Ok(UpstreamWork {
            hash,
            work,
            difficulty,
            multiplier: 1.0,
        })
    }

    async fn get_frontier(&self, account: &str) -> Result<String> {
        self.frontier_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.frontiers_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_frontiers_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.frontier_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.frontiers_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.frontiers
            .read()
            .get(account)
            .cloned()
            .ok_or_else(|| Error::Upstream("Account not found".to_string()))
    }

    async fn get_current_difficulty(&self) -> Result<Difficulty> {
        self.difficulty_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_difficulty.load(Ordering::SeqCst) {
            return Err(Error::Upstream("difficulty unavailable".to_string()));
        }
        Ok(*self.difficulty.read())
    }

    async fn passthrough(&self, body: &str) -> Result<String> {
        self.passthrough_bodies.write().push(body.to_string());
        Ok(self.passthrough_reply.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_work_is_deterministic_per_call() {
        let upstream = InMemoryUpstream::new();
        let a = upstream.compute_work("H", Difficulty(1)).await.unwrap();
        let b = upstream.compute_work("H", Difficulty(1)).await.unwrap();
        assert_eq!(a.work.len(), 16);
        assert_ne!(a.work, b.work);
        assert_eq!(a.work[..8], b.work[..8]);
        assert_eq!(upstream.work_calls(), 2);
    }

    #[tokio::test]
    async fn test_unspecified_difficulty_uses_network_value() {
        let upstream = InMemoryUpstream::new();
        let work = upstream
            .compute_work("H", Difficulty::UNSPECIFIED)
            .await
            .unwrap();
        assert_eq!(work.difficulty, DEFAULT_DIFFICULTY);
    }

    #[tokio::test]
    async fn test_unknown_account_frontier_fails() {
        let upstream = InMemoryUpstream::new();
        upstream.set_frontier("nano_1known", "F00D");
        assert_eq!(upstream.get_frontier("nano_1known").await.unwrap(), "F00D");
        assert!(upstream.get_frontier("nano_1other").await.is_err());
        assert_eq!(upstream.frontier_calls(), 2);
    }
}
