use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::types::{BackendId, ToolName};

/// One callable operation discovered on a backend.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Globally unique, always `<backend>_<original_name>`.
    pub name: ToolName,
    pub original_name: String,
    /// Path on the backend, with a leading slash.
    pub original_path: String,
    pub backend_id: BackendId,
    pub backend_display_name: String,
    pub description: String,
    /// OpenAPI `requestBody` object as published by the backend.
    pub request_body: Option<Value>,
    /// OpenAPI `parameters` array as published by the backend.
    pub parameters: Vec<Value>,
}

impl Tool {
    /// JSON schema of the request body, if the backend published one.
    pub fn input_schema(&self) -> Option<&Value> {
        self.request_body
            .as_ref()
            .and_then(|b| b.get("content"))
            .and_then(|c| c.get("application/json"))
            .and_then(|j| j.get("schema"))
    }

    /// Hierarchical route for this tool.
    pub fn endpoint(&self) -> String {
        format!("/{}/{}", self.backend_id, self.original_name)
    }
}

/// Immutable view of the catalog produced by one refresh sweep.
///
/// A snapshot is never modified after it is published; refresh builds a new
/// one and swaps it in whole.
#[derive(Debug, Default)]
pub struct ToolSnapshot {
    tools: BTreeMap<ToolName, Tool>,
    by_backend: BTreeMap<BackendId, Vec<ToolName>>,
    /// Raw API description per backend.
    descriptions: BTreeMap<BackendId, Value>,
    /// SHA-256 of each backend's raw description.
    fingerprints: BTreeMap<BackendId, String>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl ToolSnapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tools(&self) -> impl Iterator<Item = &Tool> {
        self.tools.values()
    }

    pub fn names(&self) -> Vec<ToolName> {
        self.tools.keys().cloned().collect()
    }

    pub fn for_backend(&self, backend: &str) -> Vec<&Tool> {
        self.by_backend
            .get(backend)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| self.tools.get(n))
                    .filter(|t| t.backend_id.as_str() == backend)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn description(&self, backend: &str) -> Option<&Value> {
        self.descriptions.get(backend)
    }

    pub fn descriptions(&self) -> impl Iterator<Item = (&BackendId, &Value)> {
        self.descriptions.iter()
    }

    pub fn fingerprint(&self, backend: &str) -> Option<&str> {
        self.fingerprints.get(backend).map(String::as_str)
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}

#[derive(Default)]
pub struct SnapshotBuilder {
    inner: ToolSnapshot,
}

impl SnapshotBuilder {
    /// Add every tool of one backend together with its raw description.
    ///
    /// A name already taken by an earlier backend keeps its first owner; the
    /// clashing tool is dropped.
    pub fn add_backend(mut self, backend: BackendId, tools: Vec<Tool>, description: Option<Value>) -> Self {
        let mut names: Vec<ToolName> = Vec::with_capacity(tools.len());
        for tool in tools {
            if let Some(existing) = self.inner.tools.get(&tool.name) {
                warn!(
                    tool = %tool.name,
                    backend = %backend,
                    owner = %existing.backend_id,
                    "Tool name already registered by another backend, skipping"
                );
                continue;
            }
            names.push(tool.name.clone());
            self.inner.tools.insert(tool.name.clone(), tool);
        }
        if let Some(description) = description {
            self.inner
                .fingerprints
                .insert(backend.clone(), fingerprint(&description));
            self.inner.descriptions.insert(backend.clone(), description);
        }
        self.inner.by_backend.insert(backend, names);
        self
    }

    pub fn build(mut self) -> ToolSnapshot {
        self.inner.refreshed_at = Some(Utc::now());
        self.inner
    }
}

fn fingerprint(content: &Value) -> String {
    use sha2::{Digest, Sha256};
    let content_str = serde_json::to_string(content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(content_str.as_bytes());
    format!("{:x}", hasher.finalize())
}
