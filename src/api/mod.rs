// HTTP surface of the gateway

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::Identity;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::search::{DEFAULT_SEARCH_LIMIT, describe_tools, search_tools};
use crate::server::Gateway;

pub type AppState = Arc<Gateway>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/refresh", post(refresh_cache))
        .route("/servers", get(list_servers))
        .route("/openapi.json", get(openapi))
        .route("/meta/search_tools", post(meta_search_tools))
        .route("/meta/describe_tools", post(meta_describe_tools))
        .route("/meta/call_tool", post(meta_call_tool))
        .route("/{name}", get(list_backend_tools).post(call_flat_tool))
        .route("/{backend}/{*tool_path}", post(call_backend_tool))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn usage() -> Value {
    json!({
        "list_tools": "GET /{server_id}",
        "execute_tool": "POST /{server_id}/{tool_name}",
        "example": "POST /github/search_repositories"
    })
}

fn parse_body(body: &Bytes) -> GatewayResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| GatewayError::BadRequest(e.to_string()))
}

async fn identify(state: &Gateway, headers: &HeaderMap) -> Option<Identity> {
    state.resolver.resolve_optional(headers).await
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "tools_cached": state.registry.tool_count().await,
        "backends": state.backends.len(),
        "meta_tools_mode": state.config.meta_tools_mode,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn refresh_cache(State(state): State<AppState>) -> Json<Value> {
    let summary = state.registry.refresh().await;
    Json(json!({
        "status": "refreshed",
        "tools_count": summary.tool_count,
        "meta_tools_mode": state.config.meta_tools_mode,
        "failed_backends": summary.failed_backends,
        "tools": summary.tool_names
    }))
}

async fn list_servers(State(state): State<AppState>, headers: HeaderMap) -> GatewayResult<Json<Value>> {
    let identity = identify(&state, &headers).await;
    if identity.is_none() && state.config.require_auth_for_listing {
        debug!("Anonymous server listing blocked");
        return Ok(Json(json!({
            "total_servers": 0,
            "servers": [],
            "by_tier": {},
            "message": "User not identified. Authentication is required to list servers.",
            "usage": usage()
        })));
    }

    let visible = state.visible_backends(identity.as_ref()).await?;
    let servers: Vec<Value> = visible
        .iter()
        .filter_map(|id| state.backends.get(id.as_str()))
        .map(|b| {
            json!({
                "id": b.id,
                "name": b.display_name,
                "tier": b.tier.as_str(),
                "description": b.description,
                "enabled": b.enabled,
                "endpoint": format!("/{}/", b.id),
                "tools_endpoint": format!("/{}", b.id),
            })
        })
        .collect();

    let mut by_tier: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for server in &servers {
        let tier = server["tier"].as_str().unwrap_or_default().to_string();
        by_tier.entry(tier).or_default().push(server.clone());
    }

    Ok(Json(json!({
        "total_servers": servers.len(),
        "servers": servers,
        "by_tier": by_tier,
        "usage": usage()
    })))
}

async fn openapi(State(state): State<AppState>, headers: HeaderMap) -> GatewayResult<Json<Value>> {
    let identity = identify(&state, &headers).await;
    let doc = state
        .registry
        .build_filtered_catalog(
            identity.as_ref(),
            &state.access,
            state.catalog_mode(),
            state.config.require_auth_for_listing,
        )
        .await?;
    Ok(Json(doc))
}

async fn list_backend_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let identity = identify(&state, &headers).await;
    if identity.is_none() && state.config.require_auth_for_listing {
        return Err(GatewayError::Unauthenticated(
            "authentication is required to list tools".to_string(),
        ));
    }

    let backend = state.backends.get(&name).ok_or_else(|| {
        GatewayError::NotFound(format!(
            "Server '{}' not found. Use GET /servers for available servers.",
            name
        ))
    })?;

    if let Some(identity) = &identity {
        if !state.access.can_access(identity, &backend.id).await? {
            return Err(GatewayError::AccessDenied(format!(
                "User {} does not have access to server '{}'",
                identity.email(),
                backend.id
            )));
        }
    }

    let tools: Vec<Value> = state
        .registry
        .list_for_backend(backend.id.as_str())
        .await
        .into_iter()
        .map(|t| {
            json!({
                "name": t.original_name,
                "description": t.description,
                "endpoint": t.endpoint(),
            })
        })
        .collect();

    Ok(Json(json!({
        "server_id": backend.id,
        "display_name": backend.display_name,
        "tier": backend.tier.as_str(),
        "tool_count": tools.len(),
        "tools": tools
    })))
}

async fn call_flat_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Json<Value>> {
    let arguments = parse_body(&body)?;
    let identity = identify(&state, &headers).await;
    let result = state.dispatcher.dispatch(&name, identity.as_ref(), arguments).await?;
    Ok(Json(result))
}

async fn call_backend_tool(
    State(state): State<AppState>,
    Path((backend, tool_path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Json<Value>> {
    let arguments = parse_body(&body)?;
    let identity = identify(&state, &headers).await;
    let result = state
        .dispatcher
        .dispatch(&format!("{}/{}", backend, tool_path), identity.as_ref(), arguments)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct SearchToolsRequest {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

#[derive(Debug, Deserialize)]
struct DescribeToolsRequest {
    tool_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CallToolRequest {
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

async fn meta_search_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SearchToolsRequest>,
) -> GatewayResult<Json<Value>> {
    let identity = identify(&state, &headers).await;
    let allowed = state.visible_backends(identity.as_ref()).await?;
    if allowed.is_empty() {
        return Ok(Json(json!({
            "query": request.query,
            "count": 0,
            "results": [],
            "message": "No server access configured for this user"
        })));
    }

    let snapshot = state.registry.snapshot().await;
    let results = search_tools(
        &snapshot,
        state.embeddings.as_deref(),
        &request.query,
        &allowed,
        request.limit,
    )
    .await;

    Ok(Json(json!({
        "query": request.query,
        "count": results.len(),
        "results": results
    })))
}

async fn meta_describe_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DescribeToolsRequest>,
) -> GatewayResult<Json<Value>> {
    let identity = identify(&state, &headers).await;
    let allowed = state.visible_backends(identity.as_ref()).await?;
    let snapshot = state.registry.snapshot().await;
    let tools = describe_tools(&snapshot, &request.tool_names, &allowed);
    Ok(Json(json!({ "count": tools.len(), "tools": tools })))
}

async fn meta_call_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CallToolRequest>,
) -> GatewayResult<Json<Value>> {
    let identity = identify(&state, &headers).await;
    info!(tool = %request.tool_name, "Meta tool call");
    let arguments = if request.arguments.is_null() {
        json!({})
    } else {
        request.arguments
    };
    let result = state
        .dispatcher
        .call_named_tool(&request.tool_name, identity.as_ref(), arguments)
        .await?;
    Ok(Json(result))
}
