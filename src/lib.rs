//! Nano Work Cache - Proof-of-Work Caching Accelerator
//!
//! Sits in front of a Nano node's RPC interface and answers `work_generate`
//! from a local cache whenever it can. Work is computed ahead of time for
//! hashes that are likely to be needed next (account frontiers, freshly
//! processed blocks), duplicate requests for the same hash share a single
//! node call, and the cache survives restarts via a plain text file.
//!
//! # Architecture
//!
//! ```text
//! clients ──▶ RpcServer ──▶ WorkCache ──▶ WorkUpstream (node RPC)
//!                 │            │
//!                 │            ├─ WorkStore + CachePersistence
//!                 │            ├─ PregenQueue + workers
//!                 │            └─ Housekeeper
//!                 └─ proxy ───────────────▶ node
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Node RPC client and the in-memory test upstream
//! - [`cache`] - Entry model, store, persistence and counters
//! - [`domain`] - Value objects and the upstream port
//! - [`engine`] - Resolution, pregeneration, housekeeping, service facade
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus exposition
//! - [`server`] - JSON RPC front

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod server;

// Re-export commonly used types
pub use adapters::{InMemoryUpstream, NodeRpcAdapter, NodeRpcConfig};
pub use cache::{CacheEntry, EntryStatus, StatusSnapshot, WorkStore};
pub use domain::{Difficulty, RequestInput, UpstreamWork, WorkRequest, WorkUpstream};
pub use engine::{FailurePolicy, WorkCache, WorkCacheConfig, WorkResponse, WorkSource};
pub use error::{Error, Result};
pub use server::{RpcServer, ServerConfig};
