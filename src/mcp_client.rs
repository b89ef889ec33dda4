// Streamable MCP client: JSON-RPC over HTTP with event-stream framed responses

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use http::HeaderMap;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::SessionId;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SESSION_HEADER: &str = "mcp-session-id";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Statuses that mean the session is gone or no longer accepted.
const SESSION_RETRY_STATUSES: [u16; 4] = [401, 403, 404, 409];

#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Request could not be sent or the body could not be read.
    Transport(String),
    /// Backend answered with a non-success status.
    Status { status: u16, body: String },
    /// Backend returned a JSON-RPC error object.
    Rpc { code: i64, message: String },
    /// Response body was neither JSON nor an event stream with data.
    Parse(String),
}

impl ProtocolError {
    fn is_session_error(&self) -> bool {
        matches!(self, Self::Status { status, .. } if SESSION_RETRY_STATUSES.contains(status))
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            Self::Rpc { code, message } => write!(f, "RPC error {}: {}", code, message),
            Self::Parse(msg) => write!(f, "Unparseable response: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone)]
struct Session {
    id: Option<SessionId>,
    created_at: Instant,
}

/// Extract the JSON-RPC payload from a plain JSON or event-stream body and
/// surface an `error` member as a failure.
pub fn parse_rpc_body(body: &str) -> Result<Value, ProtocolError> {
    let trimmed = body.trim();
    let payload = if trimmed.starts_with('{') {
        trimmed
    } else {
        trimmed
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .filter(|data| !data.is_empty())
            .last()
            .ok_or_else(|| ProtocolError::Parse("no data event in stream".to_string()))?
    };

    let value: Value =
        serde_json::from_str(payload).map_err(|e| ProtocolError::Parse(e.to_string()))?;

    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        return Err(ProtocolError::Rpc {
            code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(-32603),
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    Ok(value)
}

/// Session cache key: the endpoint plus a digest of the outgoing headers.
///
/// Tenant credentials travel as headers, so two callers share a session only
/// when they present identical credentials to the same endpoint.
fn session_key(endpoint: &str, headers: &HeaderMap) -> String {
    if headers.is_empty() {
        return endpoint.to_string();
    }
    let mut pairs: Vec<(&str, &[u8])> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes()))
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    for (name, value) in pairs {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value);
        hasher.update([0u8]);
    }
    format!("{}#{:x}", endpoint, hasher.finalize())
}

/// Client for backends speaking the session-based protocol.
///
/// Sessions are cached per endpoint and credential set, and re-established
/// transparently.
pub struct ProtocolClient {
    client: reqwest::Client,
    sessions: Mutex<HashMap<String, Session>>,
    init_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_id: AtomicU64,
    ttl: Duration,
}

impl ProtocolClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            sessions: Mutex::new(HashMap::new()),
            init_locks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ttl: DEFAULT_SESSION_TTL,
        })
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn post(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
        session: Option<&SessionId>,
        body: &Value,
    ) -> Result<reqwest::Response, ProtocolError> {
        let mut request = self
            .client
            .post(endpoint)
            .headers(headers.clone())
            .header(http::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(id) = session {
            request = request.header(SESSION_HEADER, id.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Perform the handshake and cache the issued session.
    pub async fn initialize(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
    ) -> Result<Option<SessionId>, ProtocolError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }
        });

        let response = self.post(endpoint, headers, None, &body).await?;
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(SessionId::new);
        let text = response
            .text()
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        parse_rpc_body(&text)?;

        info!(
            endpoint,
            has_session = session_id.is_some(),
            "Protocol session initialized"
        );

        self.sessions.lock().await.insert(
            session_key(endpoint, headers),
            Session {
                id: session_id.clone(),
                created_at: Instant::now(),
            },
        );

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        if let Err(e) = self
            .post(endpoint, headers, session_id.as_ref(), &notification)
            .await
        {
            warn!(endpoint, "Initialized notification failed: {}", e);
        }

        Ok(session_id)
    }

    /// Cached session for `endpoint`, initializing one if absent or expired.
    pub async fn ensure_session(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
    ) -> Result<Option<SessionId>, ProtocolError> {
        let key = session_key(endpoint, headers);
        if let Some(session) = self.cached_session(&key).await {
            return Ok(session);
        }

        let lock = {
            let mut locks = self.init_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another caller may have finished initializing while we waited.
        if let Some(session) = self.cached_session(&key).await {
            return Ok(session);
        }
        self.initialize(endpoint, headers).await
    }

    async fn cached_session(&self, key: &str) -> Option<Option<SessionId>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(key) {
            Some(s) if s.created_at.elapsed() < self.ttl => Some(s.id.clone()),
            Some(_) => {
                debug!(key, "Protocol session expired");
                sessions.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drop the session opened for `endpoint` with these headers.
    pub async fn invalidate(&self, endpoint: &str, headers: &HeaderMap) {
        if self
            .sessions
            .lock()
            .await
            .remove(&session_key(endpoint, headers))
            .is_some()
        {
            debug!(endpoint, "Protocol session invalidated");
        }
    }

    /// Send an RPC call and return its `result`, retrying once with a fresh
    /// session when the backend rejects the current one.
    pub async fn request(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
        method: &str,
        params: Value,
    ) -> Result<Value, ProtocolError> {
        match self.send(endpoint, headers, method, &params).await {
            Err(e) if e.is_session_error() => {
                warn!(endpoint, method, "Session rejected ({}), reinitializing", e);
                self.invalidate(endpoint, headers).await;
                self.send(endpoint, headers, method, &params).await
            }
            other => other,
        }
    }

    async fn send(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
        method: &str,
        params: &Value,
    ) -> Result<Value, ProtocolError> {
        let session = self.ensure_session(endpoint, headers).await?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let response = self.post(endpoint, headers, session.as_ref(), &body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let mut value = parse_rpc_body(&text)?;
        Ok(value.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    pub async fn list_tools(&self, endpoint: &str, headers: &HeaderMap) -> Result<Vec<Value>, ProtocolError> {
        let result = self.request(endpoint, headers, "tools/list", json!({})).await?;
        match result.get("tools") {
            Some(Value::Array(tools)) => Ok(tools.clone()),
            _ => Err(ProtocolError::Parse("tools/list result has no tools array".to_string())),
        }
    }

    pub async fn call_tool(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ProtocolError> {
        self.request(
            endpoint,
            headers,
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }
}
