// Tool extraction from backend API descriptions

use serde_json::{Value, json};

use crate::config::BackendConfig;
use crate::registry::snapshot::Tool;
use crate::types::ToolName;

/// Paths every REST backend serves that are not tools.
pub const SKIPPED_PATHS: [&str; 5] = ["/health", "/docs", "/openapi.json", "/redoc", "/"];

/// Derive the tool-facing name of a backend path: `/repos/search` -> `repos_search`.
pub fn original_name_for_path(path: &str) -> String {
    path.trim_matches('/').replace('/', "_")
}

/// Every POST operation of an OpenAPI document becomes a tool.
pub fn extract_rest_tools(backend: &BackendConfig, doc: &Value) -> Vec<Tool> {
    let Some(paths) = doc.get("paths").and_then(|p| p.as_object()) else {
        return Vec::new();
    };

    let mut tools = Vec::new();
    for (path, methods) in paths {
        if SKIPPED_PATHS.contains(&path.as_str()) {
            continue;
        }
        let Some(op) = methods.get("post") else {
            continue;
        };

        let original_name = original_name_for_path(path);
        if original_name.is_empty() {
            continue;
        }

        let description = op
            .get("summary")
            .and_then(|s| s.as_str())
            .or_else(|| op.get("description").and_then(|s| s.as_str()))
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}: {}", backend.display_name, original_name));

        tools.push(Tool {
            name: ToolName::prefixed(&backend.id, &original_name),
            original_name,
            original_path: path.clone(),
            backend_id: backend.id.clone(),
            backend_display_name: backend.display_name.clone(),
            description,
            request_body: op.get("requestBody").cloned(),
            parameters: op
                .get("parameters")
                .and_then(|p| p.as_array())
                .cloned()
                .unwrap_or_default(),
        });
    }
    tools.sort_by(|a, b| a.name.cmp(&b.name));
    tools
}

/// Tools listed by a protocol backend. Each tool's input schema is wrapped
/// as an OpenAPI request body so both kinds present the same way.
pub fn extract_protocol_tools(backend: &BackendConfig, listed: &[Value]) -> Vec<Tool> {
    listed
        .iter()
        .filter_map(|t| {
            let name = t.get("name").and_then(|n| n.as_str())?.to_string();
            let description = t
                .get("description")
                .and_then(|d| d.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("{}: {}", backend.display_name, name));
            let request_body = t.get("inputSchema").map(|schema| {
                json!({
                    "required": true,
                    "content": {"application/json": {"schema": schema}}
                })
            });

            Some(Tool {
                name: ToolName::prefixed(&backend.id, &name),
                original_path: format!("/{}", name),
                original_name: name,
                backend_id: backend.id.clone(),
                backend_display_name: backend.display_name.clone(),
                description,
                request_body,
                parameters: Vec::new(),
            })
        })
        .collect()
}
