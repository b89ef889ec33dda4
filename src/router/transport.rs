// Plain HTTP transport to REST backends and their proxies

use std::time::Duration;

use anyhow::Result;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use http::HeaderMap;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::access::TenantCredentials;
use crate::error::{GatewayError, GatewayResult};
use crate::types::BackendId;

pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers for an outgoing backend call: the backend bearer plus one
/// `X-Tenant-<key>` header per tenant credential.
pub fn outbound_headers(bearer: Option<&str>, tenant: Option<&TenantCredentials>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(token) = bearer {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    if let Some(tenant) = tenant {
        for (key, secret) in &tenant.values {
            let Ok(name) = HeaderName::from_bytes(format!("X-Tenant-{}", key).as_bytes()) else {
                warn!(tenant = %tenant.tenant_id, key = %key, "Skipping credential with invalid header name");
                continue;
            };
            let Ok(mut value) = HeaderValue::from_str(secret) else {
                warn!(tenant = %tenant.tenant_id, key = %key, "Skipping credential with invalid header value");
                continue;
            };
            value.set_sensitive(true);
            headers.insert(name, value);
        }
    }
    Ok(headers)
}

pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeout(EXECUTION_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// POST `arguments` to `{endpoint}/{path}` and relay the outcome.
    pub async fn post(
        &self,
        backend: &BackendId,
        endpoint: &str,
        path: &str,
        headers: HeaderMap,
        arguments: &Value,
    ) -> GatewayResult<Value> {
        let url = format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        debug!(backend = %backend, url = %url, "Invoking backend");

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(arguments)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::BackendUnavailable(format!("Server {} timed out", backend))
                } else {
                    GatewayError::BackendUnavailable(format!("Server {} is unreachable: {}", backend, e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::BackendUnavailable(format!("Server {} body read failed: {}", backend, e)))?;

        if !status.is_success() {
            return Err(GatewayError::BackendStatus {
                status: status.as_u16(),
                message: format!("Server {} returned: {}", backend, body),
            });
        }

        Ok(serde_json::from_str(&body).unwrap_or_else(|_| json!({ "result": body })))
    }
}
