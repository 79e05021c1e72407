//! Cache Entry Types
//!
//! One entry per block hash, plus the single-line text form used by the
//! persistence file:
//!
//! ```text
//! hash work difficulty(hex) multiplier account status timeStarted timeAdded
//! ```
//!
//! Empty fields are written as `_`.

use serde::Serialize;

use crate::domain::{Difficulty, UpstreamWork};

/// Shortest string accepted as a work value (64-bit nonce in hex)
pub const MIN_WORK_LEN: usize = 16;

/// Placeholder for empty fields in the line format
const EMPTY_FIELD: &str = "_";

/// Number of fields in a complete line
const LINE_FIELDS: usize = 8;

/// Lifecycle of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Upstream call issued, no work yet
    Computing,
    /// Work present
    Valid,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Computing => "computing",
            EntryStatus::Valid => "valid",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached (or in-flight) work result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub hash: String,
    /// Empty while computing
    pub work: String,
    pub difficulty: Difficulty,
    /// Cost relative to the base difficulty, informational
    pub multiplier: f64,
    pub account: Option<String>,
    pub status: EntryStatus,
    /// Unix seconds
    pub time_started: u64,
    /// Unix seconds, 0 while computing
    pub time_added: u64,
}

impl CacheEntry {
    /// Placeholder written right before an upstream call
    pub fn computing(hash: impl Into<String>, account: Option<String>, now: u64) -> Self {
        Self {
            hash: hash.into(),
            work: String::new(),
            difficulty: Difficulty::UNSPECIFIED,
            multiplier: 0.0,
            account,
            status: EntryStatus::Computing,
            time_started: now,
            time_added: 0,
        }
    }

    /// Completed entry built from a node response
    pub fn valid(work: UpstreamWork, account: Option<String>, time_started: u64, now: u64) -> Self {
        Self {
            hash: work.hash,
            work: work.work,
            difficulty: work.difficulty,
            multiplier: work.multiplier,
            account,
            status: EntryStatus::Valid,
            time_started,
            time_added: now,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == EntryStatus::Valid
    }

    pub fn is_computing(&self) -> bool {
        self.status == EntryStatus::Computing
    }

    /// Timestamp used for age-based eviction
    pub fn age_reference(&self) -> u64 {
        match self.status {
            EntryStatus::Valid => self.time_added,
            EntryStatus::Computing => self.time_started,
        }
    }

    /// Whether this entry satisfies a request for `requested` difficulty.
    ///
    /// Unspecified requests accept anything; otherwise the stored work must
    /// have been computed at the requested difficulty or harder.
    pub fn is_acceptable(&self, requested: Difficulty) -> bool {
        requested.is_unspecified() || self.difficulty >= requested
    }
}

/// Syntactic check separating a real proof from an empty or truncated value
pub fn is_valid_work_value(work: &str) -> bool {
    work.len() >= MIN_WORK_LEN && work.chars().all(|c| c.is_ascii_hexdigit())
}

fn pad(value: &str) -> &str {
    if value.is_empty() {
        EMPTY_FIELD
    } else {
        value
    }
}

fn unpad(token: &str) -> String {
    if token == EMPTY_FIELD {
        String::new()
    } else {
        token.to_string()
    }
}

/// Single-line representation; `None` for entries without a hash
pub fn entry_to_line(entry: &CacheEntry) -> Option<String> {
    if entry.hash.is_empty() {
        return None;
    }
    Some(format!(
        "{} {} {} {} {} {} {} {}",
        pad(&entry.hash),
        pad(&entry.work),
        entry.difficulty,
        entry.multiplier,
        pad(entry.account.as_deref().unwrap_or("")),
        entry.status,
        entry.time_started,
        entry.time_added,
    ))
}

/// Parse a line written by [`entry_to_line`].
///
/// At least hash and work are required. The remaining fields are read only
/// when all eight are present; numeric parse failures become zero. Lines
/// without a recognisable `valid` status come back as `Computing`.
pub fn entry_from_line(line: &str) -> Option<CacheEntry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }

    let mut entry = CacheEntry {
        hash: unpad(tokens[0]),
        work: unpad(tokens[1]),
        difficulty: Difficulty::UNSPECIFIED,
        multiplier: 0.0,
        account: None,
        status: EntryStatus::Computing,
        time_started: 0,
        time_added: 0,
    };

    if tokens.len() >= LINE_FIELDS {
        entry.difficulty = Difficulty(u64::from_str_radix(tokens[2], 16).unwrap_or(0));
        entry.multiplier = tokens[3].parse().unwrap_or(0.0);
        let account = unpad(tokens[4]);
        entry.account = (!account.is_empty()).then_some(account);
        if tokens[5] == EntryStatus::Valid.as_str() {
            entry.status = EntryStatus::Valid;
        }
        entry.time_started = tokens[6].parse().unwrap_or(0);
        entry.time_added = tokens[7].parse().unwrap_or(0);
    }

    Some(entry)
}
