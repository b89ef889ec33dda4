//! Tool registry.
//!
//! The registry owns the catalog of tools discovered on all enabled
//! backends. A refresh sweep fetches every backend's description
//! concurrently, each under its own timeout, builds a complete
//! [`ToolSnapshot`] and publishes it with a single pointer swap. Readers
//! clone the current `Arc` and never observe a partially built catalog.
//!
//! A backend that is slow, unreachable or returns garbage contributes
//! zero tools; it never fails the sweep.

mod catalog;
pub mod openapi;
pub mod search;
mod snapshot;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, BackendProtocol, BackendSet};
use crate::mcp_client::ProtocolClient;
use crate::router::transport::outbound_headers;
use crate::types::{BackendId, ToolName};

pub use catalog::{CatalogMode, render_catalog};
pub use snapshot::{SnapshotBuilder, Tool, ToolSnapshot};

/// Per-backend budget for fetching an API description.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub tool_count: usize,
    pub tool_names: Vec<ToolName>,
    pub failed_backends: Vec<BackendId>,
}

pub struct ToolRegistry {
    backends: Arc<BackendSet>,
    snapshot: RwLock<Arc<ToolSnapshot>>,
    refresh_lock: Mutex<()>,
    http: reqwest::Client,
    protocol: Arc<ProtocolClient>,
    fetch_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(backends: Arc<BackendSet>, protocol: Arc<ProtocolClient>) -> Result<Self> {
        Ok(Self {
            backends,
            snapshot: RwLock::new(Arc::new(ToolSnapshot::default())),
            refresh_lock: Mutex::new(()),
            http: reqwest::Client::builder().build()?,
            protocol,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn backends(&self) -> &Arc<BackendSet> {
        &self.backends
    }

    /// Current catalog. Cheap; the returned snapshot never changes.
    pub async fn snapshot(&self) -> Arc<ToolSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn lookup(&self, name: &str) -> Option<Tool> {
        self.snapshot().await.get(name).cloned()
    }

    pub async fn list_for_backend(&self, backend: &str) -> Vec<Tool> {
        self.snapshot()
            .await
            .for_backend(backend)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn tool_count(&self) -> usize {
        self.snapshot().await.len()
    }

    /// Rebuild the catalog from every enabled backend and publish it.
    ///
    /// Concurrent calls are serialized; each one performs its own sweep.
    pub async fn refresh(&self) -> RefreshSummary {
        let _guard = self.refresh_lock.lock().await;

        let mut tasks = JoinSet::new();
        for backend in self.backends.enabled() {
            let backend = backend.clone();
            let http = self.http.clone();
            let protocol = self.protocol.clone();
            let timeout = self.fetch_timeout;
            tasks.spawn(async move {
                let outcome =
                    match tokio::time::timeout(timeout, fetch_backend(&http, &protocol, &backend)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
                    };
                (backend.id, outcome)
            });
        }

        let mut fetched = Vec::new();
        let mut failed_backends = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok((tools, description)))) => fetched.push((id, tools, description)),
                Ok((id, Err(e))) => {
                    warn!(backend = %id, "Skipping backend during refresh: {}", e);
                    failed_backends.push(id);
                }
                Err(e) => warn!("Refresh task failed: {}", e),
            }
        }
        fetched.sort_by(|a, b| a.0.cmp(&b.0));
        failed_backends.sort();

        let previous = self.snapshot().await;
        let mut builder = ToolSnapshot::builder();
        for (id, tools, description) in fetched {
            debug!(backend = %id, tools = tools.len(), "Fetched backend tools");
            builder = builder.add_backend(id, tools, description);
        }
        let next = builder.build();

        for backend in self.backends.enabled() {
            let id = backend.id.as_str();
            if next.fingerprint(id).is_some() && previous.fingerprint(id) != next.fingerprint(id) {
                debug!(backend = %id, "Backend description changed");
            }
        }

        let summary = RefreshSummary {
            tool_count: next.len(),
            tool_names: next.names(),
            failed_backends,
        };
        *self.snapshot.write().await = Arc::new(next);

        info!(
            tools = summary.tool_count,
            failed = summary.failed_backends.len(),
            "Tool cache refreshed"
        );
        summary
    }

    /// Refresh until at least one tool is cached or `attempts` are used up,
    /// sleeping `delay` between attempts.
    pub async fn refresh_with_retries(&self, attempts: u32, delay: Duration) -> RefreshSummary {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let summary = self.refresh().await;
            if summary.tool_count > 0 || attempt >= attempts {
                if summary.tool_count == 0 {
                    warn!(
                        attempts,
                        "No tools cached after startup refresh; POST /refresh once backends are up"
                    );
                }
                return summary;
            }
            info!(
                attempt,
                attempts,
                "No tools cached yet, retrying in {:?}",
                delay
            );
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }
}

async fn fetch_backend(
    http: &reqwest::Client,
    protocol: &ProtocolClient,
    backend: &BackendConfig,
) -> Result<(Vec<Tool>, Option<Value>)> {
    let headers = outbound_headers(backend.credential().as_deref(), None)?;

    match backend.protocol {
        BackendProtocol::Rest => {
            let url = format!("{}/openapi.json", backend.endpoint_url);
            let response = http.get(&url).headers(headers).send().await?;
            if !response.status().is_success() {
                return Err(anyhow::anyhow!("HTTP {} from {}", response.status(), url));
            }
            let doc: Value = response.json().await?;
            let tools = openapi::extract_rest_tools(backend, &doc);
            Ok((tools, Some(doc)))
        }
        BackendProtocol::StreamableMcp => {
            let listed = protocol
                .list_tools(&backend.endpoint_url, &headers)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let tools = openapi::extract_protocol_tools(backend, &listed);
            Ok((tools, None))
        }
    }
}
