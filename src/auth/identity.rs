//! Request-scoped caller identity.

use serde::Serialize;

use crate::types::{GroupName, TenantId};

/// Which trust source established the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Claims lifted from a verified third-party token by a trusted upstream.
    EntraToken,
    /// Headers asserted by the perimeter gateway.
    ApiGateway,
    /// Identity headers accompanying a validated bearer token.
    JwtValidatedHeaders,
    /// Email taken directly from validated token claims.
    JwtClaims,
    /// Email resolved from the token's user id through the user directory.
    JwtDbLookup,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntraToken => "entra_token",
            Self::ApiGateway => "api_gateway",
            Self::JwtValidatedHeaders => "jwt_validated_headers",
            Self::JwtClaims => "jwt_claims",
            Self::JwtDbLookup => "jwt_db_lookup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

/// Identity established for one request. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    email: String,
    user_id: Option<String>,
    display_name: Option<String>,
    role: Role,
    /// Ordered as asserted, without duplicates.
    groups: Vec<GroupName>,
    auth_method: AuthMethod,
    tenant_id: Option<TenantId>,
}

impl Identity {
    pub fn new(email: impl Into<String>, auth_method: AuthMethod) -> Self {
        Self {
            email: email.into().trim().to_lowercase(),
            user_id: None,
            display_name: None,
            role: Role::User,
            groups: Vec::new(),
            auth_method,
            tenant_id: None,
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = GroupName>) -> Self {
        self.groups.clear();
        for group in groups {
            if !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn groups(&self) -> &[GroupName] {
        &self.groups
    }

    pub fn has_group(&self, group: &GroupName) -> bool {
        self.groups.contains(group)
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    /// Tenants whose credentials and endpoint overrides apply to this caller,
    /// in priority order: the asserted tenant first, then groups as asserted.
    pub fn candidate_tenants(&self) -> Vec<TenantId> {
        let mut out: Vec<TenantId> = Vec::with_capacity(self.groups.len() + 1);
        if let Some(tenant) = &self.tenant_id {
            out.push(tenant.clone());
        }
        for group in &self.groups {
            let tenant = TenantId::new(group.as_str());
            if !out.contains(&tenant) {
                out.push(tenant);
            }
        }
        out
    }
}
