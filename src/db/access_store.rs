//! Relational access data: group and user grants, tenant credentials and
//! tenant endpoint overrides.
//!
//! The store performs no policy decisions. Every call is a fresh query so
//! administrative writes made elsewhere are visible immediately.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::Db;
use crate::types::{BackendId, GroupName, TenantId};

/// A credential row for one tenant and backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRow {
    pub tenant_id: String,
    pub key_name: String,
    pub key_value: String,
}

/// An endpoint override row for one tenant and backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointOverrideRow {
    pub tenant_id: String,
    pub endpoint_url: String,
}

/// Seed data accepted by [`AccessStore::apply_seed`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessSeed {
    #[serde(default)]
    pub group_mappings: Vec<GroupMappingSeed>,
    #[serde(default)]
    pub user_access: Vec<UserAccessSeed>,
    #[serde(default)]
    pub credentials: Vec<CredentialSeed>,
    #[serde(default)]
    pub endpoint_overrides: Vec<EndpointOverrideSeed>,
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupMappingSeed {
    pub group_name: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAccessSeed {
    pub user_email: String,
    pub tenant_id: String,
    #[serde(default = "default_access_level")]
    pub access_level: String,
}

fn default_access_level() -> String {
    "read".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSeed {
    pub tenant_id: String,
    pub server_id: String,
    pub key_name: String,
    pub key_value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointOverrideSeed {
    pub tenant_id: String,
    pub server_id: String,
    pub endpoint_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Access store backed by SurrealDB.
#[derive(Clone)]
pub struct AccessStore {
    db: Db,
}

impl AccessStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Whether any of `groups` is mapped to `backend`.
    pub async fn group_grants(&self, groups: &[GroupName], backend: &BackendId) -> Result<bool> {
        if groups.is_empty() {
            return Ok(false);
        }

        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let query = r#"
            SELECT VALUE tenant_id FROM group_tenant_mapping
            WHERE group_name INSIDE $groups
              AND tenant_id = $tenant_id
            LIMIT 1
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("groups", groups))
            .bind(("tenant_id", backend.to_string()))
            .await?;

        let rows: Vec<String> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Whether `email` holds a direct grant on `backend`.
    pub async fn user_grant(&self, email: &str, backend: &BackendId) -> Result<bool> {
        let query = r#"
            SELECT VALUE tenant_id FROM user_tenant_access
            WHERE user_email = $email
              AND tenant_id = $tenant_id
            LIMIT 1
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("email", normalize_email(email)))
            .bind(("tenant_id", backend.to_string()))
            .await?;

        let rows: Vec<String> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Backends mapped to any of `groups`.
    pub async fn backends_for_groups(&self, groups: &[GroupName]) -> Result<Vec<BackendId>> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let mut res = self
            .db
            .query("SELECT VALUE tenant_id FROM group_tenant_mapping WHERE group_name INSIDE $groups")
            .bind(("groups", groups))
            .await?;

        let rows: Vec<String> = res.take(0)?;
        Ok(rows.into_iter().map(BackendId::new).collect())
    }

    /// Backends granted directly to `email`.
    pub async fn backends_for_user(&self, email: &str) -> Result<Vec<BackendId>> {
        let mut res = self
            .db
            .query("SELECT VALUE tenant_id FROM user_tenant_access WHERE user_email = $email")
            .bind(("email", normalize_email(email)))
            .await?;

        let rows: Vec<String> = res.take(0)?;
        Ok(rows.into_iter().map(BackendId::new).collect())
    }

    /// All credential rows for `backend` owned by any of `tenants`.
    pub async fn credentials_for(
        &self,
        tenants: &[TenantId],
        backend: &BackendId,
    ) -> Result<Vec<CredentialRow>> {
        if tenants.is_empty() {
            return Ok(Vec::new());
        }

        let tenants: Vec<String> = tenants.iter().map(|t| t.to_string()).collect();
        let query = r#"
            SELECT tenant_id, key_name, key_value FROM tenant_credential
            WHERE server_id = $server_id
              AND tenant_id INSIDE $tenants
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("server_id", backend.to_string()))
            .bind(("tenants", tenants))
            .await?;

        let rows: Vec<CredentialRow> = res.take(0)?;
        debug!(backend = %backend, rows = rows.len(), "Loaded tenant credential rows");
        Ok(rows)
    }

    /// All endpoint overrides for `backend` owned by any of `tenants`.
    pub async fn endpoint_overrides_for(
        &self,
        tenants: &[TenantId],
        backend: &BackendId,
    ) -> Result<Vec<EndpointOverrideRow>> {
        if tenants.is_empty() {
            return Ok(Vec::new());
        }

        let tenants: Vec<String> = tenants.iter().map(|t| t.to_string()).collect();
        let query = r#"
            SELECT tenant_id, endpoint_url FROM tenant_endpoint_override
            WHERE server_id = $server_id
              AND tenant_id INSIDE $tenants
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("server_id", backend.to_string()))
            .bind(("tenants", tenants))
            .await?;

        let rows: Vec<EndpointOverrideRow> = res.take(0)?;
        Ok(rows)
    }

    pub async fn add_group_mapping(&self, group: &GroupName, backend: &BackendId) -> Result<()> {
        self.db
            .query("CREATE group_tenant_mapping CONTENT { group_name: $group_name, tenant_id: $tenant_id }")
            .bind(("group_name", group.to_string()))
            .bind(("tenant_id", backend.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn add_user_access(
        &self,
        email: &str,
        backend: &BackendId,
        access_level: &str,
    ) -> Result<()> {
        let query = r#"
            CREATE user_tenant_access CONTENT {
                user_email: $email,
                tenant_id: $tenant_id,
                access_level: $access_level
            }
        "#;

        self.db
            .query(query)
            .bind(("email", normalize_email(email)))
            .bind(("tenant_id", backend.to_string()))
            .bind(("access_level", access_level.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Insert or replace one credential key for a tenant and backend.
    pub async fn set_credential(
        &self,
        tenant: &TenantId,
        backend: &BackendId,
        key_name: &str,
        key_value: &str,
    ) -> Result<()> {
        let query = r#"
            DELETE tenant_credential
            WHERE tenant_id = $tenant_id AND server_id = $server_id AND key_name = $key_name;
            CREATE tenant_credential CONTENT {
                tenant_id: $tenant_id,
                server_id: $server_id,
                key_name: $key_name,
                key_value: $key_value
            };
        "#;

        self.db
            .query(query)
            .bind(("tenant_id", tenant.to_string()))
            .bind(("server_id", backend.to_string()))
            .bind(("key_name", key_name.to_string()))
            .bind(("key_value", key_value.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Insert or replace the endpoint override for a tenant and backend.
    ///
    /// Only absolute http/https URLs are accepted.
    pub async fn set_endpoint_override(
        &self,
        tenant: &TenantId,
        backend: &BackendId,
        endpoint_url: &str,
    ) -> Result<()> {
        let parsed = url::Url::parse(endpoint_url)
            .map_err(|e| anyhow::anyhow!("Invalid endpoint URL `{}`: {}", endpoint_url, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "Endpoint URL must use http or https, got `{}`",
                parsed.scheme()
            ));
        }

        let query = r#"
            DELETE tenant_endpoint_override
            WHERE tenant_id = $tenant_id AND server_id = $server_id;
            CREATE tenant_endpoint_override CONTENT {
                tenant_id: $tenant_id,
                server_id: $server_id,
                endpoint_url: $endpoint_url
            };
        "#;

        self.db
            .query(query)
            .bind(("tenant_id", tenant.to_string()))
            .bind(("server_id", backend.to_string()))
            .bind(("endpoint_url", endpoint_url.trim_end_matches('/').to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Insert or replace an account in the user table.
    pub async fn upsert_user(&self, user_id: &str, email: &str, name: &str, role: &str) -> Result<()> {
        let query = r#"
            DELETE user WHERE user_id = $user_id;
            CREATE user CONTENT {
                user_id: $user_id,
                email: $email,
                name: $name,
                role: $role
            };
        "#;

        self.db
            .query(query)
            .bind(("user_id", user_id.to_string()))
            .bind(("email", normalize_email(email)))
            .bind(("name", name.to_string()))
            .bind(("role", role.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Load a seed document into the store.
    pub async fn apply_seed(&self, seed: &AccessSeed) -> Result<()> {
        for m in &seed.group_mappings {
            self.add_group_mapping(
                &GroupName::new(m.group_name.clone()),
                &BackendId::new(m.tenant_id.clone()),
            )
            .await?;
        }
        for a in &seed.user_access {
            self.add_user_access(&a.user_email, &BackendId::new(a.tenant_id.clone()), &a.access_level)
                .await?;
        }
        for c in &seed.credentials {
            self.set_credential(
                &TenantId::new(c.tenant_id.clone()),
                &BackendId::new(c.server_id.clone()),
                &c.key_name,
                &c.key_value,
            )
            .await?;
        }
        for o in &seed.endpoint_overrides {
            self.set_endpoint_override(
                &TenantId::new(o.tenant_id.clone()),
                &BackendId::new(o.server_id.clone()),
                &o.endpoint_url,
            )
            .await?;
        }
        for u in &seed.users {
            self.upsert_user(&u.user_id, &u.email, &u.name, &u.role).await?;
        }

        debug!(
            group_mappings = seed.group_mappings.len(),
            user_access = seed.user_access.len(),
            credentials = seed.credentials.len(),
            endpoint_overrides = seed.endpoint_overrides.len(),
            users = seed.users.len(),
            "Applied access seed"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, create_connection, ensure_schema};

    pub(crate) async fn setup_test_store() -> AccessStore {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        AccessStore::new(db)
    }

    #[tokio::test]
    async fn test_group_grants() {
        let store = setup_test_store().await;
        store
            .add_group_mapping(&GroupName::new("MCP-GitHub"), &BackendId::new("github"))
            .await
            .unwrap();

        let groups = vec![GroupName::new("Other"), GroupName::new("MCP-GitHub")];
        assert!(store.group_grants(&groups, &BackendId::new("github")).await.unwrap());
        assert!(!store.group_grants(&groups, &BackendId::new("linear")).await.unwrap());
        assert!(!store.group_grants(&[], &BackendId::new("github")).await.unwrap());
    }

    #[tokio::test]
    async fn test_user_grant_is_case_insensitive_on_email() {
        let store = setup_test_store().await;
        store
            .add_user_access("Alice@Example.com", &BackendId::new("github"), "read")
            .await
            .unwrap();

        assert!(store.user_grant("alice@example.com", &BackendId::new("github")).await.unwrap());
        assert!(!store.user_grant("bob@example.com", &BackendId::new("github")).await.unwrap());

        let backends = store.backends_for_user("ALICE@example.com").await.unwrap();
        assert_eq!(backends, vec![BackendId::new("github")]);
    }

    #[tokio::test]
    async fn test_set_credential_replaces_key() {
        let store = setup_test_store().await;
        let tenant = TenantId::new("Tenant-A");
        let backend = BackendId::new("github");

        store.set_credential(&tenant, &backend, "TOKEN", "old").await.unwrap();
        store.set_credential(&tenant, &backend, "TOKEN", "new").await.unwrap();

        let rows = store.credentials_for(&[tenant], &backend).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key_value, "new");
    }

    #[tokio::test]
    async fn test_endpoint_override_rejects_non_http() {
        let store = setup_test_store().await;
        let result = store
            .set_endpoint_override(
                &TenantId::new("Tenant-A"),
                &BackendId::new("github"),
                "ftp://files.example.com",
            )
            .await;
        assert!(result.is_err());

        store
            .set_endpoint_override(
                &TenantId::new("Tenant-A"),
                &BackendId::new("github"),
                "http://github-a:8000/",
            )
            .await
            .unwrap();
        let rows = store
            .endpoint_overrides_for(&[TenantId::new("Tenant-A")], &BackendId::new("github"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint_url, "http://github-a:8000");
    }

    #[tokio::test]
    async fn test_apply_seed() {
        let store = setup_test_store().await;
        let seed: AccessSeed = serde_json::from_value(serde_json::json!({
            "group_mappings": [{"group_name": "MCP-GitHub", "tenant_id": "github"}],
            "user_access": [{"user_email": "bob@example.com", "tenant_id": "linear"}],
            "users": [{"user_id": "u-1", "email": "bob@example.com"}]
        }))
        .unwrap();

        store.apply_seed(&seed).await.unwrap();

        let backends = store
            .backends_for_groups(&[GroupName::new("MCP-GitHub")])
            .await
            .unwrap();
        assert_eq!(backends, vec![BackendId::new("github")]);
        assert!(store.user_grant("bob@example.com", &BackendId::new("linear")).await.unwrap());
    }
}
