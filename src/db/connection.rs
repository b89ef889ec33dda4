use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "gateway".to_string()),
            database: env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "access".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = vec![
        // Group -> backend grants
        "DEFINE TABLE group_tenant_mapping SCHEMAFULL;
         DEFINE FIELD group_name ON TABLE group_tenant_mapping TYPE string;
         DEFINE FIELD tenant_id ON TABLE group_tenant_mapping TYPE string;
         DEFINE FIELD created_at ON TABLE group_tenant_mapping VALUE time::now();",

        // Direct user -> backend grants
        "DEFINE TABLE user_tenant_access SCHEMAFULL;
         DEFINE FIELD user_email ON TABLE user_tenant_access TYPE string;
         DEFINE FIELD tenant_id ON TABLE user_tenant_access TYPE string;
         DEFINE FIELD access_level ON TABLE user_tenant_access TYPE string DEFAULT 'read';
         DEFINE FIELD created_at ON TABLE user_tenant_access VALUE time::now();",

        // Per-tenant backend secrets
        "DEFINE TABLE tenant_credential SCHEMAFULL;
         DEFINE FIELD tenant_id ON TABLE tenant_credential TYPE string;
         DEFINE FIELD server_id ON TABLE tenant_credential TYPE string;
         DEFINE FIELD key_name ON TABLE tenant_credential TYPE string;
         DEFINE FIELD key_value ON TABLE tenant_credential TYPE string;
         DEFINE FIELD updated_at ON TABLE tenant_credential VALUE time::now();",

        // Per-tenant endpoint routing
        "DEFINE TABLE tenant_endpoint_override SCHEMAFULL;
         DEFINE FIELD tenant_id ON TABLE tenant_endpoint_override TYPE string;
         DEFINE FIELD server_id ON TABLE tenant_endpoint_override TYPE string;
         DEFINE FIELD endpoint_url ON TABLE tenant_endpoint_override TYPE string;
         DEFINE FIELD updated_at ON TABLE tenant_endpoint_override VALUE time::now();",

        // Account table owned by the chat orchestrator
        "DEFINE TABLE user SCHEMAFULL;
         DEFINE FIELD user_id ON TABLE user TYPE string;
         DEFINE FIELD email ON TABLE user TYPE string;
         DEFINE FIELD name ON TABLE user TYPE string DEFAULT '';
         DEFINE FIELD role ON TABLE user TYPE string DEFAULT 'user';",

        "DEFINE INDEX group_mapping_lookup ON TABLE group_tenant_mapping COLUMNS group_name, tenant_id;
         DEFINE INDEX user_access_lookup ON TABLE user_tenant_access COLUMNS user_email, tenant_id;
         DEFINE INDEX credential_lookup ON TABLE tenant_credential COLUMNS tenant_id, server_id;
         DEFINE INDEX override_lookup ON TABLE tenant_endpoint_override COLUMNS tenant_id, server_id UNIQUE;
         DEFINE INDEX user_id_lookup ON TABLE user COLUMNS user_id UNIQUE;
         DEFINE INDEX user_email_lookup ON TABLE user COLUMNS email;",
    ];

    for query in schema_queries {
        db.query(query).await?;
    }

    Ok(())
}
