use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Cached tokens are refreshed this long before Google says they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

/// The subset of a service-account JSON key file the service needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service account key {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse service account key {}", path.display()))
    }

    pub fn encoding_key(&self) -> Result<EncodingKey> {
        EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("service account private key is not a valid RSA PEM")
    }
}

enum TokenSource {
    ServiceAccount(ServiceAccountKey),
    MetadataServer,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: i64,
}

/// Supplies OAuth2 access tokens for Google Cloud APIs (Storage, Secret Manager).
#[derive(Clone)]
pub struct TokenProvider {
    http: Client,
    source: Arc<TokenSource>,
    cache: Arc<RwLock<Option<CachedToken>>>,
}

impl TokenProvider {
    pub fn from_service_account(http: Client, key: ServiceAccountKey) -> Self {
        Self::with_source(http, TokenSource::ServiceAccount(key))
    }

    pub fn metadata_server(http: Client) -> Self {
        Self::with_source(http, TokenSource::MetadataServer)
    }

    /// Use the key file when one is configured, the GCE metadata server otherwise.
    pub fn from_credentials_path(http: Client, path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self::from_service_account(
                http,
                ServiceAccountKey::from_file(path)?,
            )),
            None => Ok(Self::metadata_server(http)),
        }
    }

    fn with_source(http: Client, source: TokenSource) -> Self {
        Self {
            http,
            source: Arc::new(source),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn service_account(&self) -> Option<&ServiceAccountKey> {
        match self.source.as_ref() {
            TokenSource::ServiceAccount(key) => Some(key),
            TokenSource::MetadataServer => None,
        }
    }

    pub async fn access_token(&self) -> Result<String> {
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if is_fresh(cached, Utc::now()) {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let mut guard = self.cache.write().await;
        if let Some(cached) = guard.as_ref() {
            if is_fresh(cached, Utc::now()) {
                return Ok(cached.access_token.clone());
            }
        }

        let fetched = match self.source.as_ref() {
            TokenSource::ServiceAccount(key) => self.fetch_with_assertion(key).await?,
            TokenSource::MetadataServer => self.fetch_from_metadata().await?,
        };
        debug!(expires_at = %fetched.expires_at, "refreshed google access token");

        let token = fetched.access_token.clone();
        *guard = Some(fetched);
        Ok(token)
    }

    async fn fetch_with_assertion(&self, key: &ServiceAccountKey) -> Result<CachedToken> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &key.encoding_key()?,
        )
        .context("failed to sign service account assertion")?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .context("failed to reach google token endpoint")?;
        parse_token_response(response).await
    }

    async fn fetch_from_metadata(&self) -> Result<CachedToken> {
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("failed to reach GCE metadata server")?;
        parse_token_response(response).await
    }
}

async fn parse_token_response(response: reqwest::Response) -> Result<CachedToken> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("google token request failed with status {status}: {body}");
    }
    let body: TokenEndpointResponse = response
        .json()
        .await
        .context("failed to decode google token response")?;
    Ok(CachedToken {
        access_token: body.access_token,
        expires_at: Utc::now() + Duration::seconds(body.expires_in),
    })
}

fn is_fresh(token: &CachedToken, now: DateTime<Utc>) -> bool {
    token.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > now
}
