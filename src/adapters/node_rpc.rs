//! Node RPC Adapter
//!
//! Implements the `WorkUpstream` port against a Nano node's JSON RPC.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::domain::{Difficulty, UpstreamWork, WorkUpstream};
use crate::error::{Error, Result};

/// Configuration for the node client
#[derive(Debug, Clone)]
pub struct NodeRpcConfig {
    /// Node RPC endpoint
    pub url: String,

    /// Per-request timeout; work generation can take many seconds
    pub timeout: Duration,
}

impl Default for NodeRpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7076".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Node Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct WorkGenerateResponse {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    work: String,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    multiplier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountInfoResponse {
    frontier: String,
}

#[derive(Debug, Deserialize)]
struct ActiveDifficultyResponse {
    network_minimum: String,
}

// =============================================================================
// Adapter
// =============================================================================

/// HTTP client for the node
pub struct NodeRpcAdapter {
    config: NodeRpcConfig,
    client: Client,
}

impl NodeRpcAdapter {
    pub fn new(config: NodeRpcConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn post_raw(&self, body: String) -> Result<String> {
        let response = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(Error::UpstreamConnection)?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "Node returned status: {}",
                response.status()
            )));
        }

        response.text().await.map_err(Error::UpstreamConnection)
    }

    /// Post an action and decode the reply, surfacing `{"error": ...}` replies
    async fn call<T: serde::de::DeserializeOwned>(&self, request: Value) -> Result<T> {
        let text = self.post_raw(request.to_string()).await?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| Error::UpstreamResponseParse(e.to_string()))?;

        if let Some(message) = value.get("error") {
            let message = message
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| message.to_string());
            return Err(Error::Upstream(message));
        }

        serde_json::from_value(value).map_err(|e| Error::UpstreamResponseParse(e.to_string()))
    }
}

impl std::fmt::Debug for NodeRpcAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRpcAdapter")
            .field("url", &self.config.url)
            .field("timeout", &self.config.timeout)
            .finish()
    }
}

#[async_trait]
impl WorkUpstream for NodeRpcAdapter {
    #[instrument(skip(self))]
    async fn compute_work(&self, hash: &str, difficulty: Difficulty) -> Result<UpstreamWork> {
        let mut request = json!({ "action": "work_generate", "hash": hash });
        if !difficulty.is_unspecified() {
            request["difficulty"] = json!(difficulty.to_string());
        }

        let response: WorkGenerateResponse = self.call(request).await?;
        debug!(?response, "work_generate reply");

        // The node usually over-delivers; absent difficulty falls back to the request
        let returned = response
            .difficulty
            .as_deref()
            .and_then(|d| Difficulty::from_hex(d).ok())
            .unwrap_or(difficulty);
        let multiplier = response
            .multiplier
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or(1.0);

        Ok(UpstreamWork {
            hash: response.hash,
            work: response.work,
            difficulty: returned,
            multiplier,
        })
    }

    #[instrument(skip(self))]
    async fn get_frontier(&self, account: &str) -> Result<String> {
        let response: AccountInfoResponse = self
            .call(json!({ "action": "account_info", "account": account }))
            .await?;
        Ok(response.frontier)
    }

    #[instrument(skip(self))]
    async fn get_current_difficulty(&self) -> Result<Difficulty> {
        let response: ActiveDifficultyResponse =
            self.call(json!({ "action": "active_difficulty" })).await?;
        Difficulty::from_hex(&response.network_minimum)
            .map_err(|e| Error::UpstreamResponseParse(e.to_string()))
    }

    async fn passthrough(&self, body: &str) -> Result<String> {
        self.post_raw(body.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> NodeRpcConfig {
        NodeRpcConfig {
            url: "http://localhost:19999".to_string(), // Nothing listens here
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_adapter_creation() {
        let adapter = NodeRpcAdapter::new(NodeRpcConfig::default()).unwrap();
        assert_eq!(adapter.url(), "http://127.0.0.1:7076");
        assert!(format!("{:?}", adapter).contains("NodeRpcAdapter"));
    }

    #[test]
    fn test_work_generate_response_optional_fields() {
        let parsed: WorkGenerateResponse =
            serde_json::from_str(r#"{"work":"deadbeef00000001"}"#).unwrap();
        assert!(parsed.hash.is_empty());
        assert!(parsed.difficulty.is_none());
        assert!(parsed.multiplier.is_none());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let adapter = NodeRpcAdapter::new(unreachable_config()).unwrap();

        let result = adapter.compute_work("ABC", Difficulty(1)).await;
        match result {
            Err(Error::UpstreamConnection(_)) => {}
            other => panic!("Expected UpstreamConnection error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frontier_and_difficulty_fail_without_node() {
        let adapter = NodeRpcAdapter::new(unreachable_config()).unwrap();
        assert!(adapter.get_frontier("nano_1abc").await.is_err());
        assert!(adapter.get_current_difficulty().await.is_err());
        assert!(adapter.passthrough("{}").await.is_err());
    }
}
