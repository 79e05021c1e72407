//! Domain Layer
//!
//! Value objects and the upstream node port.
//!
//! # Usage
//!
//! ```ignore
//! use nano_work_cache::domain::{Difficulty, WorkUpstream};
//!
//! async fn warm<U: WorkUpstream>(node: &U, account: &str) -> Result<()> {
//!     let hash = node.get_frontier(account).await?;
//!     let work = node.compute_work(&hash, Difficulty::UNSPECIFIED).await?;
//!     // ...
//! }
//! ```

pub mod ports;

pub use ports::{Difficulty, RequestInput, UpstreamWork, WorkRequest, WorkUpstream};
