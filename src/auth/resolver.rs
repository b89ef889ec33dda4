//! Identity resolution for inbound requests.
//!
//! Trust sources are evaluated in a fixed order and the first one that
//! matches wins outright:
//!
//! 1. Signed-token assertion (`X-Auth-Source: entra-token`)
//! 2. Perimeter gateway headers (only with `api_gateway_mode`)
//! 3. Locally issued bearer token, validated before any header is trusted

use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::auth::identity::{AuthMethod, Identity, Role};
use crate::auth::jwks::{DEFAULT_CACHE_TTL_SECONDS, JwksCache};
use crate::auth::user_directory::UserDirectory;
use crate::config::GatewayConfig;
use crate::types::{GroupName, TenantId};

pub const AUTH_SOURCE_HEADER: &str = "x-auth-source";
pub const ENTRA_TOKEN_SOURCE: &str = "entra-token";

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Trust perimeter identity headers unconditionally.
    pub api_gateway_mode: bool,
    /// HS256 secret for locally issued tokens.
    pub jwt_secret: Option<String>,
    /// Group that marks a caller as global admin.
    pub admin_group: GroupName,
    /// JWKS endpoint for RS256 tokens.
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
}

impl From<&GatewayConfig> for AuthConfig {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            api_gateway_mode: cfg.api_gateway_mode,
            jwt_secret: cfg.jwt_secret.clone().filter(|s| !s.is_empty()),
            admin_group: cfg.admin_group.clone(),
            jwks_url: cfg.jwks_url.clone(),
            jwt_issuer: cfg.jwt_issuer.clone(),
            jwt_audience: cfg.jwt_audience.clone(),
        }
    }
}

/// Authentication errors.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No trust source produced an identity.
    Unauthenticated,
    /// Invalid, malformed or expired bearer token.
    InvalidToken(String),
    /// Token was valid but no email could be resolved for it.
    UnknownUser(String),
    /// Verification material is not configured.
    Misconfigured(String),
    /// User directory lookup failed.
    Directory(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "Authentication required"),
            Self::InvalidToken(msg) => write!(f, "Invalid token: {}", msg),
            Self::UnknownUser(id) => write!(f, "No email found for user {}", id),
            Self::Misconfigured(msg) => write!(f, "Authentication misconfigured: {}", msg),
            Self::Directory(msg) => write!(f, "User directory error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Claims carried by bearer tokens.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    id: Option<String>,
    sub: Option<String>,
    email: Option<String>,
    preferred_username: Option<String>,
    name: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_groups(raw: Option<&str>) -> Vec<GroupName> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(GroupName::new)
            .collect()
    })
    .unwrap_or_default()
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(|s| s.to_string())
}

/// Resolves a trusted identity from request headers.
pub struct IdentityResolver {
    config: AuthConfig,
    directory: Arc<dyn UserDirectory>,
    jwks: Option<JwksCache>,
}

impl IdentityResolver {
    pub fn new(config: AuthConfig, directory: Arc<dyn UserDirectory>) -> anyhow::Result<Self> {
        let jwks = match &config.jwks_url {
            Some(url) => Some(JwksCache::new(url.clone(), DEFAULT_CACHE_TTL_SECONDS)?),
            None => None,
        };

        if !config.api_gateway_mode && config.jwt_secret.is_none() && jwks.is_none() {
            error!(
                "No token signing secret configured (WEBUI_SECRET_KEY); bearer authentication is disabled and every token will be rejected"
            );
        }

        Ok(Self {
            config,
            directory,
            jwks,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Resolve the caller's identity or fail with the reason it could not be established.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let identity = if let Some(identity) = self.from_signed_assertion(headers) {
            identity
        } else if let Some(identity) = self.from_perimeter(headers) {
            identity
        } else {
            self.from_local_token(headers).await?
        };

        let identity = self.elevate(identity).await;
        debug!(
            email = %identity.email(),
            method = identity.auth_method().as_str(),
            groups = identity.groups().len(),
            "Resolved identity"
        );
        Ok(identity)
    }

    /// Like [`resolve`](Self::resolve) but treats every failure as anonymous.
    pub async fn resolve_optional(&self, headers: &HeaderMap) -> Option<Identity> {
        match self.resolve(headers).await {
            Ok(identity) => Some(identity),
            Err(AuthError::Unauthenticated) => None,
            Err(e) => {
                debug!("Identity not established: {}", e);
                None
            }
        }
    }

    /// Source 1: claims forwarded by the trusted token-decoding upstream.
    fn from_signed_assertion(&self, headers: &HeaderMap) -> Option<Identity> {
        if header_value(headers, AUTH_SOURCE_HEADER) != Some(ENTRA_TOKEN_SOURCE) {
            return None;
        }
        let email = header_value(headers, "x-openwebui-user-email")?;

        Some(
            Identity::new(email, AuthMethod::EntraToken)
                .with_groups(parse_groups(header_value(headers, "x-entra-groups")))
                .with_user_id(owned(header_value(headers, "x-entra-oid")))
                .with_tenant_id(header_value(headers, "x-entra-tid").map(TenantId::new))
                .with_display_name(owned(header_value(headers, "x-openwebui-user-name"))),
        )
    }

    /// Source 2: identity asserted by the perimeter gateway.
    fn from_perimeter(&self, headers: &HeaderMap) -> Option<Identity> {
        if !self.config.api_gateway_mode {
            return None;
        }
        let email = header_value(headers, "x-user-email")?;

        let admin_flag = matches!(
            header_value(headers, "x-user-admin").map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("true") | Some("1")
        );

        let identity = Identity::new(email, AuthMethod::ApiGateway)
            .with_groups(parse_groups(header_value(headers, "x-user-groups")))
            .with_user_id(owned(header_value(headers, "x-user-oid")))
            .with_tenant_id(header_value(headers, "x-tenant-id").map(TenantId::new))
            .with_display_name(owned(header_value(headers, "x-user-name")));

        Some(if admin_flag {
            identity.with_role(Role::Admin)
        } else {
            identity
        })
    }

    /// Source 3: validated bearer token, then headers or claims or directory.
    async fn from_local_token(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let token = header_value(headers, http::header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Unauthenticated)?;

        let claims = self.validate_token(token).await?;

        if let Some(email) = header_value(headers, "x-openwebui-user-email") {
            let groups = header_value(headers, "x-openwebui-user-groups")
                .or_else(|| header_value(headers, "x-user-groups"))
                .or_else(|| header_value(headers, "x-entra-groups"));
            let role = match header_value(headers, "x-openwebui-user-role") {
                Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
                _ => Role::User,
            };

            return Ok(Identity::new(email, AuthMethod::JwtValidatedHeaders)
                .with_groups(parse_groups(groups))
                .with_user_id(owned(header_value(headers, "x-openwebui-user-id")).or(claims.id))
                .with_display_name(owned(header_value(headers, "x-openwebui-user-name")))
                .with_role(role));
        }

        let groups: Vec<GroupName> = claims.groups.iter().map(GroupName::new).collect();

        if let Some(email) = claims.email.as_deref().or(claims.preferred_username.as_deref()) {
            return Ok(Identity::new(email, AuthMethod::JwtClaims)
                .with_groups(groups)
                .with_user_id(claims.id.clone().or(claims.sub.clone()))
                .with_display_name(claims.name.clone()));
        }

        let user_id = claims
            .id
            .clone()
            .or(claims.sub.clone())
            .ok_or_else(|| AuthError::InvalidToken("Token carries no user id".to_string()))?;

        let email = self
            .directory
            .lookup_email_by_user_id(&user_id)
            .await
            .map_err(|e| AuthError::Directory(e.to_string()))?
            .ok_or_else(|| AuthError::UnknownUser(user_id.clone()))?;

        Ok(Identity::new(email, AuthMethod::JwtDbLookup)
            .with_groups(groups)
            .with_user_id(Some(user_id))
            .with_display_name(claims.name))
    }

    async fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("Invalid JWT header: {}", e)))?;

        let (key, mut validation) = match header.alg {
            Algorithm::HS256 => {
                let secret = self.config.jwt_secret.as_ref().ok_or_else(|| {
                    AuthError::Misconfigured("token signing secret not set".to_string())
                })?;
                (
                    DecodingKey::from_secret(secret.as_bytes()),
                    Validation::new(Algorithm::HS256),
                )
            }
            Algorithm::RS256 => {
                let jwks = self.jwks.as_ref().ok_or_else(|| {
                    AuthError::Misconfigured("RS256 token but no JWKS URL configured".to_string())
                })?;
                let key = jwks
                    .decoding_key(header.kid.as_deref())
                    .await
                    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
                let mut validation = Validation::new(Algorithm::RS256);
                if let Some(issuer) = &self.config.jwt_issuer {
                    validation.set_issuer(&[issuer]);
                }
                (key, validation)
            }
            other => {
                return Err(AuthError::InvalidToken(format!(
                    "Unsupported algorithm {:?}",
                    other
                )));
            }
        };

        // Locally issued tokens may omit exp; when present it is enforced.
        validation.required_spec_claims.clear();
        match &self.config.jwt_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        decode::<TokenClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                warn!("Bearer token rejected: {}", e);
                AuthError::InvalidToken(e.to_string())
            })
    }

    /// Apply the admin role from the override group or the user directory.
    async fn elevate(&self, identity: Identity) -> Identity {
        if identity.is_admin() || identity.has_group(&self.config.admin_group) {
            return identity.with_role(Role::Admin);
        }
        match self.directory.is_global_admin(identity.email()).await {
            Ok(true) => identity.with_role(Role::Admin),
            Ok(false) => identity,
            Err(e) => {
                warn!("Global admin lookup failed for {}: {}", identity.email(), e);
                identity
            }
        }
    }
}
