//! JSON RPC Front
//!
//! Node-compatible RPC endpoint. Work actions are answered by the
//! [`WorkCache`]; balance and block actions are proxied and also feed the
//! pregeneration queue; everything else is proxied verbatim.
//!
//! # Actions
//!
//! | action                        | handling                                   |
//! |-------------------------------|--------------------------------------------|
//! | `work_generate`               | `WorkCache::generate`                      |
//! | `work_pregenerate_by_hash`    | queue, reply immediately                   |
//! | `work_pregenerate_by_account` | frontier lookup in background, reply now   |
//! | `account_balance(s)`          | pregenerate by account, proxy              |
//! | `process`, `block_*`          | proxy, pregenerate for the returned hash   |
//! | `work_cache_status`           | status snapshot                            |
//! | anything else                 | proxy                                      |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::Difficulty;
use crate::engine::{AdmissionLimiter, WorkCache, WorkResponse};
use crate::error::{Error, Result};
use crate::metrics::WorkCacheExporter;

const OVERLOAD_REPLY: &str = r#"{"error":"overload, too many concurrent active requests"}"#;

/// Configuration for the RPC front
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Concurrent request handlers; excess requests are rejected
    pub max_active_handlers: usize,

    /// Trigger pregeneration from balance and block actions
    pub enable_pregeneration: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_active_handlers: 200,
            enable_pregeneration: true,
        }
    }
}

// =============================================================================
// Request Shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct ActionRequest {
    #[serde(default)]
    action: String,
}

#[derive(Debug, Deserialize)]
struct WorkGenerateRequest {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    account: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PregenerateByHashRequest {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    account: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountRequest {
    #[serde(default)]
    account: String,
}

#[derive(Debug, Deserialize)]
struct AccountsRequest {
    #[serde(default)]
    accounts: Vec<String>,
}

fn error_reply(message: impl std::fmt::Display) -> String {
    json!({ "error": message.to_string() }).to_string()
}

fn work_reply(response: &WorkResponse) -> String {
    json!({
        "hash": response.hash,
        "work": response.work,
        "difficulty": response.difficulty.to_string(),
        "multiplier": response.multiplier.to_string(),
        "source": response.source.to_string(),
    })
    .to_string()
}

/// `block.account` of a request; the block may be inline JSON or a JSON string
fn block_account(request: &Value) -> Option<String> {
    let block = request.get("block")?;
    let account = match block {
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()?
            .get("account")?
            .as_str()?
            .to_string(),
        other => other.get("account")?.as_str()?.to_string(),
    };
    (!account.is_empty()).then_some(account)
}

// =============================================================================
// RPC Server
// =============================================================================

/// Action dispatcher with inbound admission control
pub struct RpcServer {
    config: ServerConfig,
    cache: Arc<WorkCache>,
    handlers: AdmissionLimiter,
}

impl RpcServer {
    pub fn new(config: ServerConfig, cache: Arc<WorkCache>) -> Arc<Self> {
        let handlers = AdmissionLimiter::new(config.max_active_handlers);
        Arc::new(Self {
            config,
            cache,
            handlers,
        })
    }

    /// Handlers currently running
    pub fn active_handlers(&self) -> usize {
        self.handlers.current()
    }

    /// Handle one request body and produce the reply body
    pub async fn handle(&self, body: &[u8]) -> String {
        let Some(_permit) = self.handlers.try_acquire() else {
            warn!(
                active = self.handlers.current(),
                max = self.handlers.max(),
                "Overload, rejecting request"
            );
            return OVERLOAD_REPLY.to_string();
        };

        let request: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => return error_reply(format!("request parse error: {}", e)),
        };
        let action = match serde_json::from_value::<ActionRequest>(request.clone()) {
            Ok(parsed) => parsed.action,
            Err(_) => String::new(),
        };
        let raw = String::from_utf8_lossy(body);

        debug!(action = %action, "Handling request");
        self.dispatch(&action, request, &raw).await
    }

    async fn dispatch(&self, action: &str, request: Value, raw: &str) -> String {
        match action {
            "work_generate" => self.work_generate(request).await,
            "work_pregenerate_by_hash" => self.pregenerate_by_hash(request),
            "work_pregenerate_by_account" => self.pregenerate_by_account(request),
            "account_balance" => {
                if let Ok(parsed) = serde_json::from_value::<AccountRequest>(request) {
                    self.trigger_by_account(vec![parsed.account]);
                }
                self.proxy(action, raw).await
            }
            "accounts_balances" => {
                if let Ok(parsed) = serde_json::from_value::<AccountsRequest>(request) {
                    self.trigger_by_account(parsed.accounts);
                }
                self.proxy(action, raw).await
            }
            "process" | "block_create" | "block_hash" => {
                self.proxy_and_pregenerate(action, &request, raw).await
            }
            "work_cache_status" | "nano-work-cache-status-internal" => self.status(),
            _ => self.proxy(action, raw).await,
        }
    }

    async fn work_generate(&self, request: Value) -> String {
        let parsed: WorkGenerateRequest = match serde_json::from_value(request) {
            Ok(parsed) => parsed,
            Err(_) => return error_reply("work_generate parse error"),
        };
        let difficulty = match parsed.difficulty.as_deref().map(str::trim) {
            None | Some("") => Difficulty::UNSPECIFIED,
            Some(hex) => match Difficulty::from_hex(hex) {
                Ok(difficulty) => difficulty,
                Err(_) => return error_reply("work_generate difficulty parse error"),
            },
        };

        match self
            .cache
            .generate(&parsed.hash, difficulty, parsed.account.as_deref())
            .await
        {
            Ok(response) => work_reply(&response),
            Err(e) => error_reply(e),
        }
    }

    fn pregenerate_by_hash(&self, request: Value) -> String {
        let parsed = match serde_json::from_value::<PregenerateByHashRequest>(request) {
            Ok(parsed) if !parsed.hash.is_empty() => parsed,
            _ => return error_reply("work_pregenerate_by_hash parse error"),
        };
        self.cache
            .pregenerate_by_hash(&parsed.hash, parsed.account.as_deref());
        json!({ "hash": parsed.hash, "source": "started_in_background" }).to_string()
    }

    fn pregenerate_by_account(&self, request: Value) -> String {
        let parsed = match serde_json::from_value::<AccountRequest>(request) {
            Ok(parsed) if !parsed.account.is_empty() => parsed,
            _ => return error_reply("work_pregenerate_by_account parse error"),
        };
        self.spawn_pregenerate_by_account(vec![parsed.account.clone()]);
        json!({ "account": parsed.account, "source": "started_in_background" }).to_string()
    }

    fn trigger_by_account(&self, accounts: Vec<String>) {
        if !self.config.enable_pregeneration {
            return;
        }
        let accounts: Vec<String> = accounts.into_iter().filter(|a| !a.is_empty()).collect();
        if !accounts.is_empty() {
            self.spawn_pregenerate_by_account(accounts);
        }
    }

    /// One background task per request; its frontier lookups run one at a time
    fn spawn_pregenerate_by_account(&self, accounts: Vec<String>) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            for account in accounts {
                cache.pregenerate_by_account(&account).await;
            }
        });
    }

    async fn proxy_and_pregenerate(&self, action: &str, request: &Value, raw: &str) -> String {
        let account = block_account(request);
        let reply = match self.cache.passthrough(raw).await {
            Ok(reply) => reply,
            Err(e) => return self.proxy_error(action, e),
        };

        if self.config.enable_pregeneration {
            let hash = serde_json::from_str::<Value>(&reply).ok().and_then(|value| {
                value
                    .get("hash")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
            match hash {
                Some(hash) if !hash.is_empty() => {
                    debug!(
                        action,
                        hash = %hash,
                        account = ?account,
                        "Pregenerating for returned block"
                    );
                    self.cache.pregenerate_by_hash(&hash, account.as_deref());
                }
                _ => debug!(action, "No hash in reply"),
            }
        }
        reply
    }

    async fn proxy(&self, action: &str, raw: &str) -> String {
        match self.cache.passthrough(raw).await {
            Ok(reply) => reply,
            Err(e) => self.proxy_error(action, e),
        }
    }

    fn proxy_error(&self, action: &str, e: Error) -> String {
        warn!(action, "Proxy call failed: {}", e);
        json!({ "error": format!("RPC error: {}", e), "action": action }).to_string()
    }

    fn status(&self) -> String {
        let mut status = match serde_json::to_value(self.cache.status()) {
            Ok(value) => value,
            Err(e) => return error_reply(e),
        };
        status["active_handler_count"] = json!(self.handlers.current());
        status["max_active_handler_count"] = json!(self.handlers.max());
        status.to_string()
    }

    // =========================================================================
    // HTTP
    // =========================================================================

    async fn http_handler(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let response = match (req.method(), req.uri().path()) {
            (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
            (&Method::POST, _) => match req.into_body().collect().await {
                Ok(collected) => {
                    let body = collected.to_bytes();
                    // Detached so a client disconnect does not abandon a node call
                    let server = self.clone();
                    match tokio::spawn(async move { server.handle(&body).await }).await {
                        Ok(reply) => json_response(reply),
                        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &error_reply(e)),
                    }
                }
                Err(e) => text_response(StatusCode::BAD_REQUEST, &error_reply(e)),
            },
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    /// Accept connections on `addr` until `shutdown` fires
    pub async fn serve(self: Arc<Self>, addr: &str, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr).await?;
        info!("RPC server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.cancelled() => {
                    info!("RPC server stopped");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| server.clone().http_handler(req));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("RPC connection error: {}", e);
                }
            });
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.config)
            .field("active_handlers", &self.handlers.current())
            .finish()
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

fn json_response(body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Serve `GET /metrics` for `cache` on `addr` until `shutdown` fires
pub async fn serve_metrics(
    addr: &str,
    cache: Arc<WorkCache>,
    shutdown: CancellationToken,
) -> Result<()> {
    let exporter = Arc::new(WorkCacheExporter::new()?);
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics address: {}", e)))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let io = TokioIo::new(stream);
        let exporter = exporter.clone();
        let cache = cache.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let exporter = exporter.clone();
                let cache = cache.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            exporter.update(&cache.status());
                            match exporter.encode() {
                                Ok((content_type, body)) => {
                                    let mut response = Response::new(Full::new(Bytes::from(body)));
                                    let value = hyper::header::HeaderValue::from_str(&content_type);
                                    if let Ok(value) = value {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    &e.to_string(),
                                ),
                            }
                        }
                        "/healthz" => text_response(StatusCode::OK, "ok"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryUpstream;
    use crate::engine::WorkCacheConfig;
    use std::time::Duration;

    fn server(config: ServerConfig) -> (Arc<RpcServer>, Arc<WorkCache>, Arc<InMemoryUpstream>) {
        let upstream = Arc::new(InMemoryUpstream::new());
        let cache = WorkCache::new(WorkCacheConfig::default(), upstream.clone()).unwrap();
        (RpcServer::new(config, cache.clone()), cache, upstream)
    }

    fn parse(reply: &str) -> Value {
        serde_json::from_str(reply).unwrap()
    }

    #[tokio::test]
    async fn test_work_generate_fresh_then_cached() {
        let (server, _, upstream) = server(ServerConfig::default());
        let body = br#"{"action":"work_generate","hash":"ABC","difficulty":"ffffffc000000000"}"#;

        let first = parse(&server.handle(body).await);
        assert_eq!(first["hash"], "ABC");
        assert_eq!(first["difficulty"], "ffffffc000000000");
        assert_eq!(first["multiplier"], "1");
        assert_eq!(first["source"], "fresh");

        let second = parse(&server.handle(body).await);
        assert_eq!(second["source"], "fromcache");
        assert_eq!(second["work"], first["work"]);
        assert_eq!(upstream.work_calls(), 1);
    }

    #[tokio::test]
    async fn test_work_generate_bad_difficulty() {
        let (server, _, upstream) = server(ServerConfig::default());
        let reply = parse(
            &server
                .handle(br#"{"action":"work_generate","hash":"ABC","difficulty":"xyz"}"#)
                .await,
        );
        assert_eq!(reply["error"], "work_generate difficulty parse error");
        assert_eq!(upstream.work_calls(), 0);
    }

    #[tokio::test]
    async fn test_work_generate_error_reply() {
        let (server, _, upstream) = server(ServerConfig::default());
        upstream.fail_work(true);
        let reply = parse(&server.handle(br#"{"action":"work_generate","hash":"ABC"}"#).await);
        assert!(reply["error"].as_str().unwrap().contains("work generation failed"));
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let (server, _, _) = server(ServerConfig::default());
        let reply = parse(&server.handle(b"not json").await);
        assert!(reply.get("error").is_some());
    }

    #[tokio::test]
    async fn test_pregenerate_by_hash_queues() {
        let (server, cache, _) = server(ServerConfig::default());
        let reply = parse(
            &server
                .handle(br#"{"action":"work_pregenerate_by_hash","hash":"ABC"}"#)
                .await,
        );
        assert_eq!(reply["source"], "started_in_background");
        assert_eq!(cache.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_pregenerate_by_account_replies_immediately() {
        let (server, cache, upstream) = server(ServerConfig::default());
        upstream.set_frontier("nano_1acct", "F1");

        let reply = parse(
            &server
                .handle(br#"{"action":"work_pregenerate_by_account","account":"nano_1acct"}"#)
                .await,
        );
        assert_eq!(reply["account"], "nano_1acct");

        while cache.queue().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(upstream.frontier_calls(), 1);
    }

    #[tokio::test]
    async fn test_account_balance_proxies_and_pregenerates() {
        let (server, cache, upstream) = server(ServerConfig::default());
        upstream.set_frontier("nano_1acct", "F1");
        upstream.set_passthrough_reply(r#"{"balance":"1000","pending":"0"}"#);

        let body = br#"{"action":"account_balance","account":"nano_1acct"}"#;
        let reply = server.handle(body).await;
        assert_eq!(reply, r#"{"balance":"1000","pending":"0"}"#);
        assert_eq!(upstream.passthrough_bodies(), vec![String::from_utf8_lossy(body).to_string()]);

        while cache.queue().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_balance_without_pregeneration() {
        let (server, cache, upstream) = server(ServerConfig {
            enable_pregeneration: false,
            ..Default::default()
        });
        upstream.set_frontier("nano_1acct", "F1");

        server
            .handle(br#"{"action":"accounts_balances","accounts":["nano_1acct"]}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(upstream.frontier_calls(), 0);
        assert!(cache.queue().is_empty());
    }

    #[tokio::test]
    async fn test_pregenerate_by_hash_requires_hash() {
        let (server, cache, _) = server(ServerConfig::default());
        let reply = parse(
            &server
                .handle(br#"{"action":"work_pregenerate_by_hash","hash":""}"#)
                .await,
        );
        assert_eq!(reply["error"], "work_pregenerate_by_hash parse error");
        let reply = parse(
            &server
                .handle(br#"{"action":"work_pregenerate_by_account"}"#)
                .await,
        );
        assert_eq!(reply["error"], "work_pregenerate_by_account parse error");
        assert!(cache.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accounts_balances_looks_up_frontiers_in_sequence() {
        let (server, cache, upstream) = server(ServerConfig::default());
        upstream.set_frontier_delay(Duration::from_millis(100));
        let accounts: Vec<String> = (0..20).map(|i| format!("nano_1acct{}", i)).collect();
        for (i, account) in accounts.iter().enumerate() {
            upstream.set_frontier(account.as_str(), format!("F{}", i));
        }

        let body = json!({ "action": "accounts_balances", "accounts": accounts }).to_string();
        server.handle(body.as_bytes()).await;

        while cache.queue().len() < 20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(upstream.frontier_calls(), 20);
        assert_eq!(upstream.peak_frontiers_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_process_pregenerates_returned_hash() {
        let (server, cache, upstream) = server(ServerConfig::default());
        upstream.set_passthrough_reply(r#"{"hash":"NEWBLOCK"}"#);

        let reply = server
            .handle(br#"{"action":"process","block":{"account":"nano_1acct","type":"state"}}"#)
            .await;
        assert_eq!(parse(&reply)["hash"], "NEWBLOCK");
        assert_eq!(cache.queue().len(), 1);
    }

    #[test]
    fn test_block_account_forms() {
        let inline = json!({"block": {"account": "nano_1a"}});
        let stringly = json!({"block": "{\"account\":\"nano_1b\"}"});
        assert_eq!(block_account(&inline).as_deref(), Some("nano_1a"));
        assert_eq!(block_account(&stringly).as_deref(), Some("nano_1b"));
        assert_eq!(block_account(&json!({})), None);
    }

    #[tokio::test]
    async fn test_unknown_action_is_proxied() {
        let (server, _, upstream) = server(ServerConfig::default());
        upstream.set_passthrough_reply(r#"{"count":"42"}"#);
        let reply = server.handle(br#"{"action":"block_count"}"#).await;
        assert_eq!(reply, r#"{"count":"42"}"#);
    }

    #[tokio::test]
    async fn test_status_action() {
        let (server, _, _) = server(ServerConfig::default());
        let reply = parse(&server.handle(br#"{"action":"work_cache_status"}"#).await);
        assert_eq!(reply["cache_size"], 0);
        assert_eq!(reply["active_handler_count"], 1);
        assert_eq!(reply["max_active_handler_count"], 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_cap() {
        let (server, _, upstream) = server(ServerConfig {
            max_active_handlers: 1,
            ..Default::default()
        });
        upstream.set_work_delay(Duration::from_secs(5));

        let busy = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .handle(br#"{"action":"work_generate","hash":"ABC"}"#)
                    .await
            })
        };
        while server.active_handlers() == 0 {
            tokio::task::yield_now().await;
        }

        let reply = server.handle(br#"{"action":"work_cache_status"}"#).await;
        assert_eq!(reply, OVERLOAD_REPLY);

        assert!(parse(&busy.await.unwrap()).get("work").is_some());
        assert_eq!(server.active_handlers(), 0);
    }
}
