use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use tenant_gateway::types::GroupName;
use tenant_gateway::{
    AccessSeed, AccessStore, BackendSet, DatabaseConfig, Gateway, GatewayConfig, create_connection,
    ensure_schema, load_backends,
};

#[derive(Parser)]
#[command(name = "tenant-gateway")]
#[command(about = "Multi-tenant MCP tool gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Shared {
    /// Backend definition file (JSON)
    #[arg(long, env = "GATEWAY_BACKENDS")]
    backends: Option<PathBuf>,
    #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
    db_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        #[command(flatten)]
        shared: Shared,
        #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0:8000")]
        bind: String,
        /// Trust identity headers set by the perimeter gateway
        #[arg(long, env = "API_GATEWAY_MODE", default_value_t = false)]
        api_gateway_mode: bool,
        /// Shared secret for locally issued HS256 tokens
        #[arg(long, env = "WEBUI_SECRET_KEY", hide_env_values = true)]
        jwt_secret: Option<String>,
        /// Deny anonymous listing and execution
        #[arg(long, env = "REQUIRE_AUTH_FOR_LISTING", default_value_t = true, action = clap::ArgAction::Set)]
        require_auth_for_listing: bool,
        /// Present the catalog as three meta tools
        #[arg(long, env = "META_TOOLS_MODE", default_value_t = false)]
        meta_tools_mode: bool,
        #[arg(long, env = "ADMIN_GROUP", default_value = tenant_gateway::config::DEFAULT_ADMIN_GROUP)]
        admin_group: String,
        #[arg(long, env = "EMBEDDINGS_URL")]
        embeddings_url: Option<String>,
        #[arg(long, env = "SKIP_CACHE_REFRESH", default_value_t = false)]
        skip_cache_refresh: bool,
        #[arg(long, env = "CACHE_REFRESH_RETRIES", default_value_t = 3)]
        refresh_retries: u32,
        #[arg(long, env = "CACHE_REFRESH_DELAY", default_value_t = 5)]
        refresh_delay_secs: u64,
        /// JWKS endpoint URL for RS256 signature verification
        #[arg(long, env = "GATEWAY_JWKS_URL")]
        jwks_url: Option<String>,
        #[arg(long, env = "GATEWAY_JWT_ISSUER")]
        jwt_issuer: Option<String>,
        #[arg(long, env = "GATEWAY_JWT_AUDIENCE")]
        jwt_audience: Option<String>,
    },
    /// Initialize the access database, optionally seeding it
    Init {
        #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
        db_url: String,
        /// JSON file with mappings, credentials, overrides and users
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Sweep every enabled backend once and print the discovered tools
    Refresh {
        #[command(flatten)]
        shared: Shared,
    },
}

async fn open_store(db_url: String) -> Result<AccessStore> {
    let db_config = DatabaseConfig {
        url: db_url,
        ..Default::default()
    };
    info!("Using database url: {}", db_config.url);
    let db = create_connection(db_config).await?;
    ensure_schema(&db).await?;
    Ok(AccessStore::new(db))
}

fn backend_set(path: Option<&PathBuf>) -> Result<Arc<BackendSet>> {
    match path {
        Some(path) => {
            let backends = load_backends(path)?;
            info!("Loaded {} backends from {}", backends.len(), path.display());
            Ok(Arc::new(BackendSet::new(backends)))
        }
        None => {
            warn!("No backend file configured; starting with no backends");
            Ok(Arc::new(BackendSet::default()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tenant_gateway=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            shared,
            bind,
            api_gateway_mode,
            jwt_secret,
            require_auth_for_listing,
            meta_tools_mode,
            admin_group,
            embeddings_url,
            skip_cache_refresh,
            refresh_retries,
            refresh_delay_secs,
            jwks_url,
            jwt_issuer,
            jwt_audience,
        } => {
            let config = GatewayConfig {
                api_gateway_mode,
                jwt_secret,
                require_auth_for_listing,
                meta_tools_mode,
                admin_group: GroupName::new(admin_group),
                embeddings_url: embeddings_url.filter(|u| !u.is_empty()),
                skip_cache_refresh,
                refresh_retries,
                refresh_delay_secs,
                jwks_url,
                jwt_issuer,
                jwt_audience,
            };

            let backends = backend_set(shared.backends.as_ref())?;
            let store = open_store(shared.db_url).await?;
            let gateway = Arc::new(Gateway::new(config, backends, store.db().clone())?);

            if let Some(summary) = gateway.startup_refresh().await {
                info!("Startup refresh cached {} tools", summary.tool_count);
            }

            tenant_gateway::serve(gateway, &bind).await?;
        }
        Commands::Init { db_url, seed } => {
            info!("Initializing database...");
            let store = open_store(db_url).await?;

            if let Some(path) = seed {
                let raw = std::fs::read_to_string(&path)?;
                let seed: AccessSeed = serde_json::from_str(&raw)?;
                store.apply_seed(&seed).await?;
                info!("Applied seed from {}", path.display());
            }
            info!("Database initialized successfully");
        }
        Commands::Refresh { shared } => {
            let backends = backend_set(shared.backends.as_ref())?;
            let store = open_store(shared.db_url).await?;
            let gateway = Gateway::new(GatewayConfig::default(), backends, store.db().clone())?;

            let summary = gateway.registry.refresh().await;
            println!("Cached {} tools", summary.tool_count);
            for name in &summary.tool_names {
                println!("  {}", name);
            }
            if !summary.failed_backends.is_empty() {
                println!();
                println!("Unreachable backends:");
                for id in &summary.failed_backends {
                    println!("  {}", id);
                }
            }
        }
    }

    Ok(())
}
