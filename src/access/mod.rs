//! Access control over backends.
//!
//! Decisions are made fresh on every call against the [`AccessStore`]:
//!
//! 1. The global-override group reaches every enabled backend with no lookups
//! 2. A group→backend mapping for any of the caller's groups grants access
//! 3. A direct user→backend row for the caller's email grants access
//!
//! Anything else is denied. There is no explicit deny row.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::auth::Identity;
use crate::config::BackendSet;
use crate::db::AccessStore;
use crate::types::{BackendId, GroupName, TenantId};

/// Credential set selected for one backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantCredentials {
    pub tenant_id: TenantId,
    pub values: BTreeMap<String, String>,
}

pub struct AccessControl {
    store: AccessStore,
    backends: Arc<BackendSet>,
    admin_group: GroupName,
}

impl AccessControl {
    pub fn new(store: AccessStore, backends: Arc<BackendSet>, admin_group: GroupName) -> Self {
        Self {
            store,
            backends,
            admin_group,
        }
    }

    pub fn store(&self) -> &AccessStore {
        &self.store
    }

    pub fn is_global_override(&self, identity: &Identity) -> bool {
        identity.has_group(&self.admin_group)
    }

    /// May `identity` reach `backend`.
    pub async fn can_access(&self, identity: &Identity, backend: &BackendId) -> Result<bool> {
        if self.is_global_override(identity) {
            return Ok(true);
        }

        if !identity.groups().is_empty() && self.store.group_grants(identity.groups(), backend).await? {
            return Ok(true);
        }

        let granted = self.store.user_grant(identity.email(), backend).await?;
        debug!(
            email = %identity.email(),
            backend = %backend,
            granted,
            "Access decision"
        );
        Ok(granted)
    }

    /// Every enabled backend `identity` may reach.
    pub async fn list_accessible_backends(&self, identity: &Identity) -> Result<BTreeSet<BackendId>> {
        let enabled: BTreeSet<BackendId> = self.backends.enabled().map(|b| b.id.clone()).collect();

        if self.is_global_override(identity) {
            return Ok(enabled);
        }

        let mut granted: BTreeSet<BackendId> = BTreeSet::new();
        if !identity.groups().is_empty() {
            granted.extend(self.store.backends_for_groups(identity.groups()).await?);
        }
        granted.extend(self.store.backends_for_user(identity.email()).await?);

        Ok(granted.intersection(&enabled).cloned().collect())
    }

    /// Credentials of the first tenant, in `candidates` order, that has any
    /// credential row for `backend`. Rows from other tenants are never merged in.
    pub async fn resolve_credentials(
        &self,
        candidates: &[TenantId],
        backend: &BackendId,
    ) -> Result<Option<TenantCredentials>> {
        let rows = self.store.credentials_for(candidates, backend).await?;

        let Some(tenant) = candidates
            .iter()
            .find(|t| rows.iter().any(|r| r.tenant_id == t.as_str()))
        else {
            return Ok(None);
        };

        let values = rows
            .into_iter()
            .filter(|r| r.tenant_id == tenant.as_str())
            .map(|r| (r.key_name, r.key_value))
            .collect::<BTreeMap<_, _>>();

        debug!(
            tenant = %tenant,
            backend = %backend,
            keys = values.len(),
            "Resolved tenant credentials"
        );
        Ok(Some(TenantCredentials {
            tenant_id: tenant.clone(),
            values,
        }))
    }

    /// Endpoint override of the first tenant, in `candidates` order, that has one.
    pub async fn resolve_endpoint_override(
        &self,
        candidates: &[TenantId],
        backend: &BackendId,
    ) -> Result<Option<String>> {
        let rows = self.store.endpoint_overrides_for(candidates, backend).await?;

        Ok(candidates.iter().find_map(|tenant| {
            rows.iter()
                .find(|r| r.tenant_id == tenant.as_str())
                .map(|r| r.endpoint_url.clone())
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::config::parse_backends;
    use crate::db::access_store::tests::setup_test_store;

    pub(crate) fn test_backends() -> Arc<BackendSet> {
        let raw = r#"{
            "backends": {
                "github": {"display_name": "GitHub", "tier": "local_container", "endpoint_url": "http://github:8000"},
                "linear": {"display_name": "Linear", "tier": "direct_http", "endpoint_url": "http://linear:8000"},
                "sonarqube": {"display_name": "SonarQube", "tier": "stdio_proxy", "endpoint_url": "http://mcpo-stdio/sonarqube"},
                "atlassian": {"display_name": "Atlassian", "tier": "event_stream_proxy", "endpoint_url": "http://mcpo-sse/atlassian", "enabled": false}
            }
        }"#;
        Arc::new(BackendSet::new(parse_backends(raw).unwrap()))
    }

    async fn setup() -> AccessControl {
        let store = setup_test_store().await;
        AccessControl::new(store, test_backends(), GroupName::new("MCP-Admin"))
    }

    fn identity(email: &str, groups: &[&str]) -> Identity {
        Identity::new(email, AuthMethod::ApiGateway)
            .with_groups(groups.iter().map(|g| GroupName::new(*g)))
    }

    #[tokio::test]
    async fn test_override_returns_every_enabled_backend() {
        let access = setup().await;
        let admin = identity("root@example.com", &["MCP-Admin"]);

        let backends = access.list_accessible_backends(&admin).await.unwrap();
        let ids: Vec<&str> = backends.iter().map(|b| b.as_str()).collect();
        assert_eq!(ids, vec!["github", "linear", "sonarqube"]);
        assert!(access.can_access(&admin, &BackendId::new("linear")).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_then_user_grants() {
        let access = setup().await;
        access
            .store()
            .add_group_mapping(&GroupName::new("MCP-GitHub"), &BackendId::new("github"))
            .await
            .unwrap();
        access
            .store()
            .add_user_access("ivan@example.com", &BackendId::new("linear"), "read")
            .await
            .unwrap();

        let ivan = identity("ivan@example.com", &["MCP-GitHub"]);
        assert!(access.can_access(&ivan, &BackendId::new("github")).await.unwrap());
        assert!(access.can_access(&ivan, &BackendId::new("linear")).await.unwrap());
        assert!(!access.can_access(&ivan, &BackendId::new("sonarqube")).await.unwrap());

        let listed = access.list_accessible_backends(&ivan).await.unwrap();
        assert_eq!(
            listed,
            BTreeSet::from([BackendId::new("github"), BackendId::new("linear")])
        );

        let stranger = identity("judy@example.com", &[]);
        assert!(!access.can_access(&stranger, &BackendId::new("github")).await.unwrap());
        assert!(access.list_accessible_backends(&stranger).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_backend_not_listed() {
        let access = setup().await;
        access
            .store()
            .add_group_mapping(&GroupName::new("MCP-Atlassian"), &BackendId::new("atlassian"))
            .await
            .unwrap();

        let user = identity("kim@example.com", &["MCP-Atlassian"]);
        assert!(access.list_accessible_backends(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_come_from_first_tenant_only() {
        let access = setup().await;
        let backend = BackendId::new("github");
        let store = access.store();
        store.set_credential(&TenantId::new("A"), &backend, "TOKEN", "a-token").await.unwrap();
        store.set_credential(&TenantId::new("B"), &backend, "TOKEN", "b-token").await.unwrap();
        store.set_credential(&TenantId::new("B"), &backend, "ORG", "b-org").await.unwrap();

        let creds = access
            .resolve_credentials(&[TenantId::new("A"), TenantId::new("B")], &backend)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creds.tenant_id, TenantId::new("A"));
        assert_eq!(
            creds.values,
            BTreeMap::from([("TOKEN".to_string(), "a-token".to_string())])
        );

        let creds = access
            .resolve_credentials(&[TenantId::new("C"), TenantId::new("B")], &backend)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creds.tenant_id, TenantId::new("B"));
        assert_eq!(creds.values.len(), 2);

        assert!(access
            .resolve_credentials(&[TenantId::new("C")], &backend)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_endpoint_override_priority() {
        let access = setup().await;
        let backend = BackendId::new("github");
        let store = access.store();
        store
            .set_endpoint_override(&TenantId::new("A"), &backend, "http://github-a:8000")
            .await
            .unwrap();
        store
            .set_endpoint_override(&TenantId::new("B"), &backend, "http://github-b:8000")
            .await
            .unwrap();

        let url = access
            .resolve_endpoint_override(&[TenantId::new("B"), TenantId::new("A")], &backend)
            .await
            .unwrap();
        assert_eq!(url.as_deref(), Some("http://github-b:8000"));

        assert!(access
            .resolve_endpoint_override(&[], &backend)
            .await
            .unwrap()
            .is_none());
    }
}
