//! Signing keys for identity-provider tokens.
//!
//! When an RS256 issuer is configured, bearer tokens signed by it are
//! verified against keys published at its JWKS endpoint. Keys are cached
//! for a TTL and a stale set is served for a bounded time when the
//! endpoint is unreachable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Default cache TTL in seconds (1 hour).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;

/// Maximum age of a key set served after a failed refetch (24 hours).
pub const MAX_STALE_CACHE_SECONDS: u64 = 86400;

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    pub n: Option<String>,
    pub e: Option<String>,
    pub x5c: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

#[derive(Default)]
struct KeySet {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

/// Cached key set for one issuer.
pub struct JwksCache {
    jwks_url: String,
    ttl: Duration,
    state: RwLock<KeySet>,
    client: reqwest::Client,
}

impl JwksCache {
    pub fn new(jwks_url: impl Into<String>, ttl_seconds: u64) -> anyhow::Result<Self> {
        Ok(Self {
            jwks_url: jwks_url.into(),
            ttl: Duration::from_secs(ttl_seconds),
            state: RwLock::new(KeySet::default()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
        })
    }

    /// Decoding key for `kid`, or the first cached key when the token has no kid.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, JwksCacheError> {
        let fresh = {
            let state = self.state.read().await;
            state.fetched_at.is_some_and(|t| t.elapsed() <= self.ttl)
        };

        if fresh && let Some(key) = self.cached(kid).await {
            return Ok(key);
        }

        match self.fetch_keys().await {
            Ok(()) => self.cached(kid).await.ok_or_else(|| match kid {
                Some(k) => JwksCacheError::KeyNotFound(k.to_string()),
                None => JwksCacheError::NoKeysAvailable,
            }),
            Err(e) => {
                let stale_ok = {
                    let state = self.state.read().await;
                    state
                        .fetched_at
                        .is_some_and(|t| t.elapsed() < Duration::from_secs(MAX_STALE_CACHE_SECONDS))
                };
                if stale_ok && let Some(key) = self.cached(kid).await {
                    warn!("JWKS fetch failed, using stale keys: {}", e);
                    return Ok(key);
                }
                Err(e)
            }
        }
    }

    async fn cached(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let state = self.state.read().await;
        match kid {
            Some(k) => state.keys.get(k).cloned(),
            None => state.keys.values().next().cloned(),
        }
    }

    /// Fetch and replace the cached key set.
    pub async fn fetch_keys(&self) -> Result<(), JwksCacheError> {
        debug!("Fetching JWKS from {}", self.jwks_url);

        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| JwksCacheError::FetchError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksCacheError::FetchError(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|e| JwksCacheError::ParseError(e.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in document.keys {
            if jwk.kty != "RSA" || jwk.key_use.as_deref() == Some("enc") {
                continue;
            }
            match jwk_to_decoding_key(&jwk) {
                Ok(key) => {
                    keys.insert(jwk.kid.clone().unwrap_or_else(|| "default".to_string()), key);
                }
                Err(e) => warn!("Skipping unusable JWK: {}", e),
            }
        }

        if keys.is_empty() {
            return Err(JwksCacheError::NoValidKeys);
        }

        let mut state = self.state.write().await;
        debug!("Cached {} signing keys", keys.len());
        state.keys = keys;
        state.fetched_at = Some(Instant::now());
        Ok(())
    }

    pub async fn key_count(&self) -> usize {
        self.state.read().await.keys.len()
    }
}

fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, JwksCacheError> {
    if let (Some(n), Some(e)) = (&jwk.n, &jwk.e) {
        return DecodingKey::from_rsa_components(n, e)
            .map_err(|e| JwksCacheError::ParseError(format!("Invalid RSA components: {}", e)));
    }

    // x5c entries are standard base64 DER certificates
    let cert = jwk
        .x5c
        .as_ref()
        .and_then(|chain| chain.first())
        .ok_or_else(|| JwksCacheError::ParseError("RSA key has neither n/e nor x5c".to_string()))?;
    let der = base64::engine::general_purpose::STANDARD
        .decode(cert)
        .map_err(|e| JwksCacheError::ParseError(format!("Invalid x5c: {}", e)))?;
    Ok(DecodingKey::from_rsa_der(&der))
}

#[derive(Debug, Clone)]
pub enum JwksCacheError {
    FetchError(String),
    ParseError(String),
    NoValidKeys,
    KeyNotFound(String),
    NoKeysAvailable,
}

impl std::fmt::Display for JwksCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchError(msg) => write!(f, "Failed to fetch JWKS: {}", msg),
            Self::ParseError(msg) => write!(f, "Failed to parse JWKS: {}", msg),
            Self::NoValidKeys => write!(f, "No valid keys found in JWKS"),
            Self::KeyNotFound(kid) => write!(f, "Key not found: {}", kid),
            Self::NoKeysAvailable => write!(f, "No keys available in cache"),
        }
    }
}

impl std::error::Error for JwksCacheError {}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODULUS: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    #[tokio::test]
    async fn test_fetch_and_lookup_by_kid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "keys": [
                    {"kty": "RSA", "kid": "sig-1", "use": "sig", "n": MODULUS, "e": "AQAB"},
                    {"kty": "RSA", "kid": "enc-1", "use": "enc", "n": MODULUS, "e": "AQAB"},
                    {"kty": "EC", "kid": "ec-1"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = JwksCache::new(format!("{}/keys", server.uri()), DEFAULT_CACHE_TTL_SECONDS).unwrap();
        assert!(cache.decoding_key(Some("sig-1")).await.is_ok());
        assert_eq!(cache.key_count().await, 1);

        // Served from cache, no second fetch.
        assert!(cache.decoding_key(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_kid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "keys": [{"kty": "RSA", "kid": "sig-1", "n": MODULUS, "e": "AQAB"}]
            })))
            .mount(&server)
            .await;

        let cache = JwksCache::new(format!("{}/keys", server.uri()), DEFAULT_CACHE_TTL_SECONDS).unwrap();
        let err = cache.decoding_key(Some("other")).await.err().unwrap();
        assert!(matches!(err, JwksCacheError::KeyNotFound(ref k) if k == "other"));
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = JwksCache::new(format!("{}/keys", server.uri()), DEFAULT_CACHE_TTL_SECONDS).unwrap();
        let err = cache.decoding_key(None).await.err().unwrap();
        assert!(matches!(err, JwksCacheError::FetchError(_)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            JwksCacheError::KeyNotFound("key123".to_string()).to_string(),
            "Key not found: key123"
        );
    }
}
