//! Inbound tool call dispatch.
//!
//! A call moves through a fixed sequence: resolve the backend, check it is
//! enabled, check access when an identity is present, resolve the concrete
//! endpoint and credentials, invoke the transport and relay the result.
//!
//! When authentication is required, an anonymous call is rejected before any
//! resolution so the response never depends on which backends exist.
//!
//! Paths are resolved in this order:
//!
//! 1. First segment names a configured backend: hierarchical route, the rest
//!    of the path is the tool path on that backend (a cached tool's original
//!    name maps back to its original path)
//! 2. Whole path is a cached prefixed tool name: legacy flat route
//! 3. Anything else is not found

pub mod transport;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::access::AccessControl;
use crate::auth::Identity;
use crate::config::{BackendConfig, BackendProtocol, BackendSet, Transport};
use crate::error::{GatewayError, GatewayResult};
use crate::mcp_client::{ProtocolClient, ProtocolError};
use crate::registry::ToolRegistry;
use crate::types::{BackendId, ToolName};

use transport::{HttpTransport, outbound_headers};

/// Where an inbound path leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub backend: BackendId,
    /// Tool path on the backend, without a leading slash.
    pub tool_path: String,
    /// True when reached through the deprecated flat tool name.
    pub legacy: bool,
}

impl ResolvedRoute {
    /// Tool name as the backend knows it.
    pub fn original_name(&self) -> String {
        self.tool_path.replace('/', "_")
    }
}

impl From<ProtocolError> for GatewayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Transport(msg) => GatewayError::BackendUnavailable(msg),
            other => GatewayError::ProtocolError(other.to_string()),
        }
    }
}

/// Strip one level of `{"arguments": {...}}` wrapping.
pub fn unwrap_arguments(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.get("arguments").is_some_and(Value::is_object) => {
            map.remove("arguments").unwrap_or(Value::Null)
        }
        other => other,
    }
}

pub struct Dispatcher {
    backends: Arc<BackendSet>,
    registry: Arc<ToolRegistry>,
    access: Arc<AccessControl>,
    protocol: Arc<ProtocolClient>,
    http: HttpTransport,
    require_auth: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        access: Arc<AccessControl>,
        protocol: Arc<ProtocolClient>,
        http: HttpTransport,
        require_auth: bool,
    ) -> Self {
        Self {
            backends: registry.backends().clone(),
            registry,
            access,
            protocol,
            http,
            require_auth,
        }
    }

    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    pub async fn resolve_route(&self, path: &str) -> GatewayResult<ResolvedRoute> {
        let path = path.trim_matches('/');
        let (first, rest) = path.split_once('/').unwrap_or((path, ""));

        if self.backends.get(first).is_some() {
            if rest.is_empty() {
                return Err(GatewayError::NotFound(format!("No tool path given for server {}", first)));
            }
            let backend = BackendId::new(first);
            let advertised = self
                .registry
                .lookup(ToolName::prefixed(&backend, rest).as_str())
                .await
                .filter(|tool| tool.backend_id == backend && tool.original_name == rest);
            let tool_path = match advertised {
                Some(tool) => tool.original_path.trim_start_matches('/').to_string(),
                None => rest.to_string(),
            };
            return Ok(ResolvedRoute {
                backend,
                tool_path,
                legacy: false,
            });
        }

        if let Some(tool) = self.registry.lookup(path).await {
            return Ok(ResolvedRoute {
                backend: tool.backend_id,
                tool_path: tool.original_path.trim_start_matches('/').to_string(),
                legacy: true,
            });
        }

        Err(GatewayError::NotFound(format!("Tool or server not found: {}", path)))
    }

    fn check_authenticated(&self, identity: Option<&Identity>) -> GatewayResult<()> {
        if identity.is_none() && self.require_auth {
            return Err(GatewayError::Unauthenticated(
                "authentication is required to execute tools".to_string(),
            ));
        }
        Ok(())
    }

    /// Execute the tool addressed by `path` with the request `body`.
    pub async fn dispatch(&self, path: &str, identity: Option<&Identity>, body: Value) -> GatewayResult<Value> {
        self.check_authenticated(identity)?;
        let route = self.resolve_route(path).await?;
        if route.legacy {
            debug!(path, backend = %route.backend, "Deprecated flat tool route used");
        }
        self.execute(&route, identity, body).await
    }

    /// Execute a cached tool addressed by its full prefixed name.
    pub async fn call_named_tool(
        &self,
        tool_name: &str,
        identity: Option<&Identity>,
        arguments: Value,
    ) -> GatewayResult<Value> {
        self.check_authenticated(identity)?;
        let tool = self
            .registry
            .lookup(tool_name)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("Tool '{}' not found", tool_name)))?;
        let route = ResolvedRoute {
            backend: tool.backend_id,
            tool_path: tool.original_path.trim_start_matches('/').to_string(),
            legacy: false,
        };
        self.execute(&route, identity, arguments).await
    }

    async fn execute(&self, route: &ResolvedRoute, identity: Option<&Identity>, body: Value) -> GatewayResult<Value> {
        let backend = self
            .backends
            .get(route.backend.as_str())
            .ok_or_else(|| GatewayError::NotFound(format!("Server not found: {}", route.backend)))?;

        if !backend.enabled {
            return Err(GatewayError::BackendUnavailable(format!(
                "Server {} is disabled",
                backend.id
            )));
        }

        match identity {
            None => debug!(backend = %backend.id, "Anonymous tool call"),
            Some(identity) => {
                if !self.access.can_access(identity, &backend.id).await? {
                    info!(
                        email = %identity.email(),
                        backend = %backend.id,
                        "Tool call denied"
                    );
                    return Err(GatewayError::AccessDenied(format!(
                        "Access denied to server {}",
                        backend.id
                    )));
                }
            }
        }

        let arguments = unwrap_arguments(body);

        let candidates = identity.map(Identity::candidate_tenants).unwrap_or_default();
        let (credentials, endpoint_override) = if candidates.is_empty() {
            (None, None)
        } else {
            let (credentials, endpoint_override) = tokio::join!(
                self.access.resolve_credentials(&candidates, &backend.id),
                self.access.resolve_endpoint_override(&candidates, &backend.id),
            );
            (credentials?, endpoint_override?)
        };

        let endpoint = endpoint_override.as_deref().unwrap_or(&backend.endpoint_url);
        if endpoint_override.is_some() {
            debug!(backend = %backend.id, "Using tenant endpoint override");
        }

        let headers = outbound_headers(backend.credential().as_deref(), credentials.as_ref())?;
        self.invoke(backend, endpoint, route, headers, arguments).await
    }

    async fn invoke(
        &self,
        backend: &BackendConfig,
        endpoint: &str,
        route: &ResolvedRoute,
        headers: http::HeaderMap,
        arguments: Value,
    ) -> GatewayResult<Value> {
        if backend.protocol == BackendProtocol::StreamableMcp {
            return Ok(self
                .protocol
                .call_tool(endpoint, &headers, &route.original_name(), arguments)
                .await?);
        }

        match backend.tier.transport() {
            Transport::Http | Transport::ProxiedHttp => {
                self.http
                    .post(&backend.id, endpoint, &route.tool_path, headers, &arguments)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::db::access_store::tests::setup_test_store;
    use crate::registry::tests::{backends_for, openapi_doc, registry};
    use crate::types::{GroupName, TenantId};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn dispatcher(backends: Arc<BackendSet>, require_auth: bool) -> Dispatcher {
        let registry = Arc::new(registry(backends.clone()));
        registry.refresh().await;
        let access = Arc::new(AccessControl::new(
            setup_test_store().await,
            backends,
            GroupName::new("MCP-Admin"),
        ));
        let protocol = Arc::new(ProtocolClient::new(std::time::Duration::from_secs(5)).unwrap());
        Dispatcher::new(registry, access, protocol, HttpTransport::new().unwrap(), require_auth)
    }

    async fn rest_backend() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/openapi.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openapi_doc(&["/search_repositories"])))
            .mount(&server)
            .await;
        server
    }

    fn identity(email: &str, groups: &[&str]) -> Identity {
        Identity::new(email, AuthMethod::ApiGateway)
            .with_groups(groups.iter().map(|g| GroupName::new(*g)))
    }

    #[test]
    fn test_unwrap_arguments_once() {
        assert_eq!(
            unwrap_arguments(json!({"arguments": {"arguments": {"q": 1}}})),
            json!({"arguments": {"q": 1}})
        );
        assert_eq!(unwrap_arguments(json!({"q": 1})), json!({"q": 1}));
        assert_eq!(unwrap_arguments(json!({"arguments": "text"})), json!({"arguments": "text"}));
    }

    #[tokio::test]
    async fn test_route_resolution_order() {
        let server = rest_backend().await;
        let dispatcher = dispatcher(backends_for(&[("github", server.uri(), true, "rest")]), false).await;

        let hierarchical = dispatcher.resolve_route("/github/repos/search").await.unwrap();
        assert_eq!(hierarchical.backend, BackendId::new("github"));
        assert_eq!(hierarchical.tool_path, "repos/search");
        assert!(!hierarchical.legacy);

        let legacy = dispatcher.resolve_route("github_search_repositories").await.unwrap();
        assert_eq!(legacy.tool_path, "search_repositories");
        assert!(legacy.legacy);

        let missing = dispatcher.resolve_route("/nothing_here").await.unwrap_err();
        assert_eq!(missing.status_code().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_advertised_route_reaches_nested_backend_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/openapi.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openapi_doc(&["/repos/search"])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(2)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(backends_for(&[("github", server.uri(), true, "rest")]), false).await;
        let tool = dispatcher.registry.lookup("github_repos_search").await.unwrap();
        assert_eq!(tool.endpoint(), "/github/repos_search");

        let route = dispatcher.resolve_route(&tool.endpoint()).await.unwrap();
        assert_eq!(route.tool_path, "repos/search");

        let out = dispatcher.dispatch(&tool.endpoint(), None, json!({})).await.unwrap();
        assert_eq!(out, json!({"ok": true}));
        let out = dispatcher.dispatch("/github/repos/search", None, json!({})).await.unwrap();
        assert_eq!(out, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_anonymous_calls_do_not_reveal_backends() {
        let server = rest_backend().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(
            backends_for(&[
                ("github", server.uri(), true, "rest"),
                ("legacy", server.uri(), false, "rest"),
            ]),
            true,
        )
        .await;

        for path in ["/nonexistent/x", "/github/x", "/legacy/x", "github_search_repositories", "/nothing"] {
            let err = dispatcher.dispatch(path, None, json!({})).await.unwrap_err();
            assert_eq!(err.status_code().as_u16(), 401, "path {}", path);
        }
        for name in ["github_search_repositories", "unknown_tool"] {
            let err = dispatcher.call_named_tool(name, None, json!({})).await.unwrap_err();
            assert_eq!(err.status_code().as_u16(), 401, "tool {}", name);
        }
    }

    #[tokio::test]
    async fn test_legacy_call_unwraps_arguments_once() {
        let server = rest_backend().await;
        Mock::given(method("POST"))
            .and(path("/search_repositories"))
            .and(body_json(json!({"arguments": {"query": "rust"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 3})))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(backends_for(&[("github", server.uri(), true, "rest")]), false).await;
        let out = dispatcher
            .dispatch(
                "github_search_repositories",
                None,
                json!({"arguments": {"arguments": {"query": "rust"}}}),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({"total": 3}));
    }

    #[tokio::test]
    async fn test_hierarchical_call_unwraps_arguments() {
        let server = rest_backend().await;
        Mock::given(method("POST"))
            .and(path("/search_repositories"))
            .and(body_json(json!({"query": "mcp"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(backends_for(&[("github", server.uri(), true, "rest")]), false).await;
        let out = dispatcher
            .dispatch("/github/search_repositories", None, json!({"arguments": {"query": "mcp"}}))
            .await
            .unwrap();
        assert_eq!(out, json!({"result": "plain text"}));
    }

    #[tokio::test]
    async fn test_named_tool_call() {
        let server = rest_backend().await;
        Mock::given(method("POST"))
            .and(path("/search_repositories"))
            .and(body_json(json!({"query": "mcp"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(backends_for(&[("github", server.uri(), true, "rest")]), false).await;
        let out = dispatcher
            .call_named_tool("github_search_repositories", None, json!({"arguments": {"query": "mcp"}}))
            .await
            .unwrap();
        assert_eq!(out, json!({"total": 1}));

        let err = dispatcher
            .call_named_tool("github/search_repositories", None, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_disabled_backend_is_unavailable_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(backends_for(&[("github", server.uri(), false, "rest")]), false).await;
        let err = dispatcher
            .dispatch("/github/search_repositories", None, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 503);
    }

    #[tokio::test]
    async fn test_anonymous_and_denied_calls() {
        let server = rest_backend().await;
        Mock::given(method("POST"))
            .and(path("/search_repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(backends_for(&[("github", server.uri(), true, "rest")]), true).await;

        let err = dispatcher
            .dispatch("/github/search_repositories", None, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 401);

        let stranger = identity("eve@example.com", &["Nobody"]);
        let err = dispatcher
            .dispatch("/github/search_repositories", Some(&stranger), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 403);

        dispatcher
            .access
            .store()
            .add_group_mapping(&GroupName::new("MCP-GitHub"), &BackendId::new("github"))
            .await
            .unwrap();
        let member = identity("dev@example.com", &["MCP-GitHub"]);
        let out = dispatcher
            .dispatch("/github/search_repositories", Some(&member), json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_tenant_override_and_credentials() {
        let default_server = rest_backend().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"from": "default"})))
            .expect(0)
            .mount(&default_server)
            .await;

        let tenant_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search_repositories"))
            .and(header("x-tenant-org", "acme-org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"from": "tenant"})))
            .expect(1)
            .mount(&tenant_server)
            .await;

        let dispatcher = dispatcher(backends_for(&[("github", default_server.uri(), true, "rest")]), true).await;
        let backend = BackendId::new("github");
        let store = dispatcher.access.store();
        store
            .add_group_mapping(&GroupName::new("Acme"), &backend)
            .await
            .unwrap();
        store
            .set_credential(&TenantId::new("Acme"), &backend, "ORG", "acme-org")
            .await
            .unwrap();
        store
            .set_endpoint_override(&TenantId::new("Acme"), &backend, &tenant_server.uri())
            .await
            .unwrap();

        let caller = identity("ops@acme.example", &["Acme"]);
        let out = dispatcher
            .dispatch("github_search_repositories", Some(&caller), json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!({"from": "tenant"}));
    }
}
