use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs, path::Path};

use crate::types::{BackendId, GroupName};

/// Default group that grants access to every enabled backend.
pub const DEFAULT_ADMIN_GROUP: &str = "MCP-Admin";

/// Transport family a backend is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    DirectHttp,
    EventStreamProxy,
    StdioProxy,
    LocalContainer,
}

/// How a tier is invoked at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain HTTP POST against the backend endpoint.
    Http,
    /// Plain HTTP POST against a proxy that hides the native transport.
    ProxiedHttp,
}

impl BackendTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectHttp => "http",
            Self::EventStreamProxy => "sse",
            Self::StdioProxy => "stdio",
            Self::LocalContainer => "local",
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Self::DirectHttp | Self::LocalContainer => Transport::Http,
            Self::EventStreamProxy | Self::StdioProxy => Transport::ProxiedHttp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    #[serde(rename = "oauth")]
    OAuth,
    ApiKey,
    None,
}

/// Wire protocol spoken by the backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendProtocol {
    /// REST with an `/openapi.json` description.
    #[default]
    Rest,
    /// Session-based JSON-RPC over HTTP and event streams.
    StreamableMcp,
}

/// One entry of the backend JSON file.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendEntry {
    pub display_name: String,
    pub tier: BackendTier,
    pub endpoint_url: String,
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub protocol: BackendProtocol,
}

fn default_auth_type() -> AuthType {
    AuthType::Bearer
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct BackendsFile {
    pub backends: BTreeMap<String, BackendEntry>,
}

/// Static configuration for a backend, immutable for the process lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct BackendConfig {
    pub id: BackendId,
    pub display_name: String,
    pub tier: BackendTier,
    pub endpoint_url: String,
    pub auth_type: AuthType,
    /// Name of the environment variable holding the bearer credential.
    pub credential_ref: Option<String>,
    pub enabled: bool,
    pub description: String,
    pub protocol: BackendProtocol,
}

impl BackendConfig {
    pub fn from_entry(id: String, entry: BackendEntry) -> anyhow::Result<Self> {
        let endpoint_url = expand_env_vars(&entry.endpoint_url);
        url::Url::parse(&endpoint_url).map_err(|e| {
            anyhow::anyhow!("Backend `{}` has invalid endpoint_url `{}`: {}", id, endpoint_url, e)
        })?;

        Ok(Self {
            id: BackendId::new(id),
            display_name: entry.display_name,
            tier: entry.tier,
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            auth_type: entry.auth_type,
            credential_ref: entry.credential_ref.map(|r| expand_env_vars(&r)),
            enabled: entry.enabled,
            description: entry.description,
            protocol: entry.protocol,
        })
    }

    /// Resolve the backend's bearer credential from its environment reference.
    pub fn credential(&self) -> Option<String> {
        if self.auth_type == AuthType::None {
            return None;
        }
        self.credential_ref
            .as_ref()
            .and_then(|name| env::var(name).ok())
            .filter(|v| !v.is_empty())
    }
}

/// Configured backends keyed by id.
#[derive(Debug, Clone, Default)]
pub struct BackendSet {
    by_id: BTreeMap<BackendId, BackendConfig>,
}

impl BackendSet {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            by_id: backends.into_iter().map(|b| (b.id.clone(), b)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&BackendConfig> {
        self.by_id.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &BackendConfig> {
        self.by_id.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &BackendConfig> {
        self.by_id.values().filter(|b| b.enabled)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Load backend definitions from a JSON file.
pub fn load_backends(path: &Path) -> anyhow::Result<Vec<BackendConfig>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    parse_backends(&raw)
}

pub fn parse_backends(raw: &str) -> anyhow::Result<Vec<BackendConfig>> {
    let file: BackendsFile = serde_json::from_str(raw)?;
    file.backends
        .into_iter()
        .map(|(id, entry)| BackendConfig::from_entry(id, entry))
        .collect()
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Deployment flags for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Trust perimeter-asserted identity headers unconditionally.
    pub api_gateway_mode: bool,
    /// Shared secret for locally issued HS256 tokens.
    pub jwt_secret: Option<String>,
    /// Deny anonymous listing and execution.
    pub require_auth_for_listing: bool,
    /// Present the catalog as three meta tools.
    pub meta_tools_mode: bool,
    pub admin_group: GroupName,
    pub embeddings_url: Option<String>,
    pub skip_cache_refresh: bool,
    pub refresh_retries: u32,
    pub refresh_delay_secs: u64,
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_gateway_mode: false,
            jwt_secret: None,
            require_auth_for_listing: true,
            meta_tools_mode: false,
            admin_group: GroupName::new(DEFAULT_ADMIN_GROUP),
            embeddings_url: None,
            skip_cache_refresh: false,
            refresh_retries: 3,
            refresh_delay_secs: 5,
            jwks_url: None,
            jwt_issuer: None,
            jwt_audience: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "backends": {
            "github": {
                "display_name": "GitHub",
                "tier": "local_container",
                "endpoint_url": "http://mcp-github:8000/",
                "credential_ref": "GITHUB_TOKEN"
            },
            "atlassian": {
                "display_name": "Atlassian",
                "tier": "event_stream_proxy",
                "endpoint_url": "http://mcpo-sse/atlassian",
                "auth_type": "oauth",
                "enabled": false
            },
            "linear": {
                "display_name": "Linear",
                "tier": "direct_http",
                "endpoint_url": "https://mcp.linear.app/mcp",
                "protocol": "streamable_mcp"
            }
        }
    }"#;

    #[test]
    fn test_parse_backends() {
        let backends = parse_backends(SAMPLE).unwrap();
        assert_eq!(backends.len(), 3);

        let github = backends.iter().find(|b| b.id.as_str() == "github").unwrap();
        assert_eq!(github.endpoint_url, "http://mcp-github:8000");
        assert_eq!(github.tier, BackendTier::LocalContainer);
        assert_eq!(github.auth_type, AuthType::Bearer);
        assert!(github.enabled);
        assert_eq!(github.protocol, BackendProtocol::Rest);

        let atlassian = backends.iter().find(|b| b.id.as_str() == "atlassian").unwrap();
        assert!(!atlassian.enabled);
        assert_eq!(atlassian.auth_type, AuthType::OAuth);

        let linear = backends.iter().find(|b| b.id.as_str() == "linear").unwrap();
        assert_eq!(linear.protocol, BackendProtocol::StreamableMcp);
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let raw = r#"{"backends": {"bad": {"display_name": "Bad", "tier": "direct_http", "endpoint_url": "not a url"}}}"#;
        assert!(parse_backends(raw).is_err());
    }

    #[test]
    fn test_tier_transport_table() {
        assert_eq!(BackendTier::DirectHttp.transport(), Transport::Http);
        assert_eq!(BackendTier::LocalContainer.transport(), Transport::Http);
        assert_eq!(BackendTier::EventStreamProxy.transport(), Transport::ProxiedHttp);
        assert_eq!(BackendTier::StdioProxy.transport(), Transport::ProxiedHttp);
        assert_eq!(BackendTier::EventStreamProxy.as_str(), "sse");
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown() {
        assert_eq!(
            expand_env_vars("http://${TENANT_GATEWAY_SURELY_UNSET_VAR}/x"),
            "http://${TENANT_GATEWAY_SURELY_UNSET_VAR}/x"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
    }

    #[test]
    fn test_load_backends_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let backends = load_backends(file.path()).unwrap();
        assert_eq!(backends.len(), 3);
    }

    #[test]
    fn test_credential_none_auth() {
        let mut backend = parse_backends(SAMPLE)
            .unwrap()
            .into_iter()
            .find(|b| b.id.as_str() == "github")
            .unwrap();
        backend.auth_type = AuthType::None;
        assert_eq!(backend.credential(), None);
    }
}
