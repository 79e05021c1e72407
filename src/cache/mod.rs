//! Work Cache Store
//!
//! In-memory mapping from block hash to computed work, with its on-disk
//! form and the counters reported by the status endpoint.
//!
//! # Entry Lifecycle
//!
//! ```text
//!   (absent) ──put(computing)──▶ Computing ──put(valid)──▶ Valid
//!       ▲                            │                       │
//!       └──── age sweep / rollback ──┴──── age sweep ────────┘
//! ```
//!
//! A valid entry is overwritten in place when a request needs a harder
//! difficulty than it was computed at.

mod entry;
mod metrics;
mod persist;
mod store;

pub use entry::{
    entry_from_line, entry_to_line, is_valid_work_value, CacheEntry, EntryStatus, MIN_WORK_LEN,
};
pub use metrics::{StatusSnapshot, WorkMetrics};
pub use persist::CachePersistence;
pub use store::{unix_now, WorkStore};
