//! Error types for the Work Cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Work Cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed inbound request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Resolution Errors
    // =========================================================================
    /// Another request is computing this hash and did not finish in time
    #[error("Work for hash {hash} still in progress after {waited:?}")]
    InProgressTimeout { hash: String, waited: Duration },

    /// Outbound work call cap reached
    #[error("Overload, {outstanding} outstanding work requests to node (max {max})")]
    Overloaded { outstanding: usize, max: usize },

    /// Upstream returned a work value that does not look like a proof
    #[error("Invalid work value '{work}' returned for hash {hash}")]
    InvalidWork { hash: String, work: String },

    /// Frontier of an account could not be obtained
    #[error("Could not obtain frontier block for account {account}: {reason}")]
    FrontierUnavailable { account: String, reason: String },

    // =========================================================================
    // Upstream Node Errors
    // =========================================================================
    /// Node connection error
    #[error("Node connection error: {0}")]
    UpstreamConnection(#[source] reqwest::Error),

    /// Node reported an error
    #[error("Node error: {0}")]
    Upstream(String),

    /// Node response parse error
    #[error("Failed to parse node response: {0}")]
    UpstreamResponseParse(String),
}

impl Error {
    /// Whether this error was raised before any upstream call was made
    pub fn is_overload(&self) -> bool {
        matches!(self, Error::Overloaded { .. })
    }
}
