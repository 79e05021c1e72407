//! Domain Ports (Port/Adapter Pattern)
//!
//! Value objects shared by the cache engine and the upstream node port the
//! engine depends on. Infrastructure adapters implement [`WorkUpstream`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Work Cache Engine                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                 WorkUpstream (Trait)                 │    │
//! │  │  compute_work │ get_frontier │ current_difficulty   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │        NodeRpcAdapter (HTTP)  │  InMemoryUpstream (tests)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Proof-of-work difficulty threshold.
///
/// Higher values are harder; a work value computed at a higher difficulty
/// also satisfies any request for a lower one. Rendered as lowercase hex,
/// which is how the node and the persistence file represent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Difficulty(pub u64);

impl Difficulty {
    /// Placeholder meaning "use the current network default".
    pub const UNSPECIFIED: Difficulty = Difficulty(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }

    /// Parse a hex difficulty, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u64::from_str_radix(digits, 16)
            .map(Difficulty)
            .map_err(|e| Error::InvalidRequest(format!("difficulty '{}': {}", s, e)))
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for Difficulty {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<u64> for Difficulty {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// How a work request identifies the block to compute for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestInput {
    /// Hash is known up front
    ByHash,
    /// Hash is the account's frontier, resolved lazily
    ByAccount,
}

/// One resolution attempt, as carried through the pregeneration queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub input: RequestInput,
    /// Absent for `ByAccount` requests whose frontier is not yet known
    pub hash: Option<String>,
    pub difficulty: Difficulty,
    pub account: Option<String>,
}

impl WorkRequest {
    pub fn by_hash(
        hash: impl Into<String>,
        difficulty: Difficulty,
        account: Option<String>,
    ) -> Self {
        Self {
            input: RequestInput::ByHash,
            hash: Some(hash.into()),
            difficulty,
            account,
        }
    }

    pub fn by_account(account: impl Into<String>) -> Self {
        Self {
            input: RequestInput::ByAccount,
            hash: None,
            difficulty: Difficulty::UNSPECIFIED,
            account: Some(account.into()),
        }
    }
}

/// Work as returned by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamWork {
    /// May be empty if the node omitted it
    pub hash: String,
    pub work: String,
    pub difficulty: Difficulty,
    pub multiplier: f64,
}

// =============================================================================
// Upstream Port
// =============================================================================

/// Port for the proof-of-work generating node.
///
/// Transport-level timeouts are the adapter's concern; the engine never
/// cancels a call once issued.
#[async_trait]
pub trait WorkUpstream: Send + Sync {
    /// Compute work for a block hash at (at least) the given difficulty.
    /// An unspecified difficulty lets the node pick its default.
    async fn compute_work(&self, hash: &str, difficulty: Difficulty) -> Result<UpstreamWork>;

    /// Latest block hash of an account.
    async fn get_frontier(&self, account: &str) -> Result<String>;

    /// Current network minimum difficulty.
    async fn get_current_difficulty(&self) -> Result<Difficulty>;

    /// Forward a raw JSON request body and return the raw reply.
    async fn passthrough(&self, body: &str) -> Result<String>;
}
