//! Infrastructure Adapters
//!
//! Implementations of the [`WorkUpstream`](crate::domain::WorkUpstream) port.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Work Cache Engine                         │
//! │                    WorkUpstream (Port Trait)                     │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   NodeRpcAdapter (reqwest, JSON RPC) │ InMemoryUpstream (tests)  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod in_memory;
mod node_rpc;

pub use in_memory::InMemoryUpstream;
pub use node_rpc::{NodeRpcAdapter, NodeRpcConfig};
