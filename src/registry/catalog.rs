// Access-filtered OpenAPI description of the gateway

use std::collections::BTreeSet;

use anyhow::Result;
use serde_json::{Map, Value, json};

use crate::access::AccessControl;
use crate::auth::Identity;
use crate::config::BackendSet;
use crate::registry::{ToolRegistry, ToolSnapshot};
use crate::types::BackendId;

pub const CATALOG_TITLE: &str = "Multi-Tenant MCP Gateway";

/// How the catalog is presented to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogMode {
    /// One route per tool.
    Full,
    /// Three fixed routes regardless of how many tools exist.
    MetaTools,
}

fn open_schema() -> Value {
    json!({"type": "object", "additionalProperties": true})
}

fn json_body(schema: Value) -> Value {
    json!({
        "required": true,
        "content": {"application/json": {"schema": schema}}
    })
}

fn ok_response(description: &str) -> Value {
    json!({
        "200": {
            "description": description,
            "content": {"application/json": {"schema": open_schema()}}
        }
    })
}

fn fixed_get(summary: &str, operation_id: &str) -> Value {
    json!({"get": {"summary": summary, "operationId": operation_id, "responses": ok_response(summary)}})
}

/// Render the catalog for the given set of accessible backends.
pub fn render_catalog(
    snapshot: &ToolSnapshot,
    backends: &BackendSet,
    accessible: &BTreeSet<BackendId>,
    mode: CatalogMode,
) -> Value {
    let mut paths = Map::new();
    paths.insert("/health".to_string(), fixed_get("Health check", "health"));

    let mut schemas = Map::new();

    match mode {
        CatalogMode::MetaTools => {
            paths.insert(
                "/meta/search_tools".to_string(),
                json!({"post": {
                    "summary": "Search available tools by free-text query",
                    "operationId": "search_tools",
                    "requestBody": json_body(json!({
                        "type": "object",
                        "required": ["query"],
                        "properties": {
                            "query": {"type": "string"},
                            "limit": {"type": "integer", "default": 10}
                        }
                    })),
                    "responses": ok_response("Matching tools")
                }}),
            );
            paths.insert(
                "/meta/describe_tools".to_string(),
                json!({"post": {
                    "summary": "Describe the input schema of named tools",
                    "operationId": "describe_tools",
                    "requestBody": json_body(json!({
                        "type": "object",
                        "required": ["tool_names"],
                        "properties": {
                            "tool_names": {"type": "array", "items": {"type": "string"}}
                        }
                    })),
                    "responses": ok_response("Tool schemas")
                }}),
            );
            paths.insert(
                "/meta/call_tool".to_string(),
                json!({"post": {
                    "summary": "Call a named tool with arguments",
                    "operationId": "call_tool",
                    "requestBody": json_body(json!({
                        "type": "object",
                        "required": ["tool_name"],
                        "properties": {
                            "tool_name": {"type": "string"},
                            "arguments": {"type": "object", "additionalProperties": true}
                        }
                    })),
                    "responses": ok_response("Tool result")
                }}),
            );
        }
        CatalogMode::Full => {
            paths.insert("/servers".to_string(), fixed_get("List accessible servers", "list_servers"));
            paths.insert(
                "/refresh".to_string(),
                json!({"post": {"summary": "Refresh the tool cache", "operationId": "refresh", "responses": ok_response("Refresh summary")}}),
            );

            for backend_id in accessible {
                let Some(backend) = backends.get(backend_id.as_str()) else {
                    continue;
                };
                paths.insert(
                    format!("/{}", backend_id),
                    json!({"get": {
                        "summary": format!("List {} tools", backend.display_name),
                        "operationId": format!("{}_list_tools", backend_id),
                        "tags": [backend.display_name],
                        "responses": ok_response("Tools of this server")
                    }}),
                );

                for tool in snapshot.for_backend(backend_id.as_str()) {
                    let body = tool
                        .request_body
                        .clone()
                        .unwrap_or_else(|| json_body(open_schema()));
                    let mut operation = json!({
                        "summary": tool.description,
                        "description": tool.description,
                        "operationId": tool.name.as_str(),
                        "tags": [tool.backend_display_name],
                        "requestBody": body,
                        "responses": ok_response("Tool result")
                    });
                    if !tool.parameters.is_empty() {
                        operation["parameters"] = Value::Array(tool.parameters.clone());
                    }

                    paths.insert(tool.endpoint(), json!({ "post": operation.clone() }));

                    operation["deprecated"] = Value::Bool(true);
                    operation["operationId"] = Value::String(format!("{}_legacy", tool.name));
                    paths.insert(format!("/{}", tool.name), json!({ "post": operation }));
                }

                if let Some(found) = snapshot
                    .description(backend_id.as_str())
                    .and_then(|d| d.pointer("/components/schemas"))
                    .and_then(|s| s.as_object())
                {
                    for (name, schema) in found {
                        schemas.entry(name.clone()).or_insert_with(|| schema.clone());
                    }
                }
            }
        }
    }

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": CATALOG_TITLE,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": paths,
        "components": {"schemas": schemas}
    })
}

impl ToolRegistry {
    /// Catalog limited to what `identity` may reach.
    ///
    /// Anonymous callers see every enabled backend unless `require_auth` is
    /// set, in which case they see none.
    pub async fn build_filtered_catalog(
        &self,
        identity: Option<&Identity>,
        access: &AccessControl,
        mode: CatalogMode,
        require_auth: bool,
    ) -> Result<Value> {
        let accessible = match identity {
            Some(identity) => access.list_accessible_backends(identity).await?,
            None if require_auth => BTreeSet::new(),
            None => self.backends().enabled().map(|b| b.id.clone()).collect(),
        };
        let snapshot = self.snapshot().await;
        Ok(render_catalog(&snapshot, self.backends(), &accessible, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::tests::test_backends;
    use crate::registry::snapshot::tests::tool;

    fn snapshot() -> ToolSnapshot {
        let mut create = tool("github", "create_issue", "Create an issue");
        create.request_body = Some(json_body(json!({"$ref": "#/components/schemas/Issue"})));
        ToolSnapshot::builder()
            .add_backend(
                BackendId::new("github"),
                vec![create, tool("github", "search_repositories", "Search repos")],
                Some(json!({"components": {"schemas": {"Issue": {"type": "object"}}}})),
            )
            .add_backend(BackendId::new("linear"), vec![tool("linear", "list_issues", "List")], None)
            .build()
    }

    #[test]
    fn test_full_catalog_only_lists_accessible_backends() {
        let accessible = BTreeSet::from([BackendId::new("github")]);
        let doc = render_catalog(&snapshot(), &test_backends(), &accessible, CatalogMode::Full);

        assert_eq!(doc["openapi"], "3.1.0");
        assert_eq!(doc["info"]["title"], CATALOG_TITLE);

        let paths = doc["paths"].as_object().unwrap();
        for fixed in ["/health", "/servers", "/refresh", "/github"] {
            assert!(paths.contains_key(fixed), "missing {}", fixed);
        }

        let create = &paths["/github/create_issue"]["post"];
        assert_eq!(create["operationId"], "github_create_issue");
        assert_eq!(create["tags"][0], "GITHUB");
        assert_eq!(
            create["requestBody"]["content"]["application/json"]["schema"]["$ref"],
            "#/components/schemas/Issue"
        );

        let search = &paths["/github/search_repositories"]["post"];
        assert_eq!(
            search["requestBody"]["content"]["application/json"]["schema"],
            open_schema()
        );

        assert_eq!(paths["/github_create_issue"]["post"]["deprecated"], true);
        assert!(!paths.keys().any(|p| p.starts_with("/linear")));
        assert!(doc["components"]["schemas"].get("Issue").is_some());
    }

    #[test]
    fn test_meta_catalog_has_three_tools() {
        let accessible = BTreeSet::from([BackendId::new("github"), BackendId::new("linear")]);
        let doc = render_catalog(&snapshot(), &test_backends(), &accessible, CatalogMode::MetaTools);

        let mut paths: Vec<&String> = doc["paths"].as_object().unwrap().keys().collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["/health", "/meta/call_tool", "/meta/describe_tools", "/meta/search_tools"]
        );
    }

    #[test]
    fn test_empty_access_yields_fixed_routes_only() {
        let doc = render_catalog(&snapshot(), &test_backends(), &BTreeSet::new(), CatalogMode::Full);
        assert_eq!(doc["paths"].as_object().unwrap().len(), 3);
    }
}
