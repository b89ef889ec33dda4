// Gateway assembly and HTTP serving

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::access::AccessControl;
use crate::auth::{AuthConfig, Identity, IdentityResolver, UserStore};
use crate::config::{BackendSet, GatewayConfig};
use crate::db::{AccessStore, Db};
use crate::mcp_client::ProtocolClient;
use crate::registry::search::{EmbeddingSearch, HttpEmbeddingSearch};
use crate::registry::{CatalogMode, DEFAULT_FETCH_TIMEOUT, RefreshSummary, ToolRegistry};
use crate::router::Dispatcher;
use crate::router::transport::{EXECUTION_TIMEOUT, HttpTransport};
use crate::types::BackendId;

/// Everything a request handler needs, shared behind an `Arc`.
pub struct Gateway {
    pub config: GatewayConfig,
    pub backends: Arc<BackendSet>,
    pub registry: Arc<ToolRegistry>,
    pub access: Arc<AccessControl>,
    pub resolver: IdentityResolver,
    pub dispatcher: Dispatcher,
    pub embeddings: Option<Box<dyn EmbeddingSearch>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, backends: Arc<BackendSet>, db: Db) -> Result<Self> {
        let store = AccessStore::new(db.clone());
        let access = Arc::new(AccessControl::new(
            store,
            backends.clone(),
            config.admin_group.clone(),
        ));
        let resolver = IdentityResolver::new(AuthConfig::from(&config), Arc::new(UserStore::new(db)))?;

        let protocol = Arc::new(ProtocolClient::new(EXECUTION_TIMEOUT)?);
        let registry = Arc::new(ToolRegistry::new(backends.clone(), protocol.clone())?);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            access.clone(),
            protocol,
            HttpTransport::new()?,
            config.require_auth_for_listing,
        );

        let embeddings: Option<Box<dyn EmbeddingSearch>> = match &config.embeddings_url {
            Some(url) => Some(Box::new(HttpEmbeddingSearch::new(url.as_str())?)),
            None => None,
        };

        Ok(Self {
            config,
            backends,
            registry,
            access,
            resolver,
            dispatcher,
            embeddings,
        })
    }

    pub fn catalog_mode(&self) -> CatalogMode {
        if self.config.meta_tools_mode {
            CatalogMode::MetaTools
        } else {
            CatalogMode::Full
        }
    }

    /// Backends the caller may see. Anonymous callers see every enabled
    /// backend unless authentication is required for listing.
    pub async fn visible_backends(&self, identity: Option<&Identity>) -> Result<BTreeSet<BackendId>> {
        match identity {
            Some(identity) => self.access.list_accessible_backends(identity).await,
            None if self.config.require_auth_for_listing => Ok(BTreeSet::new()),
            None => Ok(self.backends.enabled().map(|b| b.id.clone()).collect()),
        }
    }

    /// Populate the tool cache before serving, retrying while backends come up.
    pub async fn startup_refresh(&self) -> Option<RefreshSummary> {
        if self.config.skip_cache_refresh {
            info!("Skipping startup cache refresh");
            return None;
        }

        let retries = self.config.refresh_retries.max(1);
        let delay = Duration::from_secs(self.config.refresh_delay_secs);
        let budget = (delay + DEFAULT_FETCH_TIMEOUT + Duration::from_secs(1)) * retries;

        match tokio::time::timeout(budget, self.registry.refresh_with_retries(retries, delay)).await {
            Ok(summary) => Some(summary),
            Err(_) => {
                warn!("Startup cache refresh exceeded {:?}; serving with the current cache", budget);
                None
            }
        }
    }
}

pub async fn serve(gateway: Arc<Gateway>, bind: &str) -> Result<()> {
    let router = crate::api::create_router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;

    info!(
        backends = gateway.backends.len(),
        tools = gateway.registry.tool_count().await,
        meta_tools_mode = gateway.config.meta_tools_mode,
        "Gateway listening on http://{}",
        bind
    );

    axum::serve(listener, router).await?;
    Ok(())
}
