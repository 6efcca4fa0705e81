use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{ObjectInfo, ObjectStore};
use crate::google::{ServiceAccountKey, TokenProvider};

const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";
const SIGNING_HOST: &str = "storage.googleapis.com";
const SIGNING_ALGORITHM: &str = "GOOG4-RSA-SHA256";
/// V4 signatures cannot outlive seven days.
const MAX_SIGNED_URL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct GcsObject {
    name: String,
    // The JSON API encodes uint64 fields as strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

/// Cloud Storage bucket reached through the JSON API.
pub struct GcsStore {
    http: Client,
    tokens: TokenProvider,
    bucket: String,
    client_email: String,
    signing_key: EncodingKey,
}

impl GcsStore {
    pub fn new(
        http: Client,
        tokens: TokenProvider,
        bucket: String,
        key: ServiceAccountKey,
    ) -> Result<Self> {
        let signing_key = key.encoding_key()?;
        Ok(Self {
            http,
            tokens,
            bucket,
            client_email: key.client_email,
            signing_key,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{API_BASE}/b/{}/o/{}",
            self.bucket,
            urlencoding::encode(key)
        )
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put_new(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<bool> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(format!("{UPLOAD_BASE}/b/{}/o", self.bucket))
            // Generation 0 means "only if no live object has this name".
            .query(&[("uploadType", "media"), ("name", key), ("ifGenerationMatch", "0")])
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("failed to upload gs://{}/{key}", self.bucket))?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        ensure_success(response, "upload", key).await?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let token = self.tokens.access_token().await?;
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{API_BASE}/b/{}/o", self.bucket))
                .query(&[
                    ("prefix", prefix),
                    ("delimiter", "/"),
                    ("fields", "items(name,size,updated),nextPageToken"),
                ])
                .bearer_auth(&token);
            if let Some(page) = page_token.as_deref() {
                request = request.query(&[("pageToken", page)]);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("failed to list gs://{}/{prefix}", self.bucket))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("cloud storage list of `{prefix}` failed with {status}: {body}");
            }
            let page: ListResponse = response
                .json()
                .await
                .context("failed to decode cloud storage list response")?;

            objects.extend(page.items.into_iter().map(|item| ObjectInfo {
                size: item
                    .size
                    .as_deref()
                    .and_then(|size| size.parse().ok())
                    .unwrap_or(0),
                updated_at: item.updated,
                key: item.name,
            }));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.object_url(key))
            .query(&[("fields", "name")])
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("failed to stat gs://{}/{key}", self.bucket))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("cloud storage stat of `{key}` failed with {status}: {body}")
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .delete(self.object_url(key))
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("failed to delete gs://{}/{key}", self.bucket))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response, "delete", key).await
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let request = V4Request::new(&self.bucket, key, &self.client_email, Utc::now(), ttl);
        let string_to_sign = request.string_to_sign();
        let signature = jsonwebtoken::crypto::sign(
            string_to_sign.as_bytes(),
            &self.signing_key,
            Algorithm::RS256,
        )
        .context("failed to sign cloud storage url")?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .context("signer returned malformed base64")?;
        Ok(request.url(&hex::encode(signature)))
    }
}

async fn ensure_success(response: reqwest::Response, action: &str, key: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    bail!("cloud storage {action} of `{key}` failed with {status}: {body}")
}

/// Pieces of a V4 signed GET request for a single object.
struct V4Request {
    canonical_uri: String,
    canonical_query: String,
    timestamp: String,
    scope: String,
}

impl V4Request {
    fn new(
        bucket: &str,
        key: &str,
        client_email: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{}/auto/storage/goog4_request", now.format("%Y%m%d"));
        let expires = ttl.as_secs().clamp(1, MAX_SIGNED_URL_SECS);

        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let canonical_uri = format!("/{bucket}/{encoded_key}");

        let credential = format!("{client_email}/{scope}");
        let mut params = vec![
            ("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string()),
            ("X-Goog-Credential", credential),
            ("X-Goog-Date", timestamp.clone()),
            ("X-Goog-Expires", expires.to_string()),
            ("X-Goog-SignedHeaders", "host".to_string()),
        ];
        params.sort_by(|a, b| a.0.cmp(b.0));
        let canonical_query = params
            .iter()
            .map(|(name, value)| format!("{}={}", name, urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        Self {
            canonical_uri,
            canonical_query,
            timestamp,
            scope,
        }
    }

    fn canonical_request(&self) -> String {
        format!(
            "GET\n{}\n{}\nhost:{SIGNING_HOST}\n\nhost\nUNSIGNED-PAYLOAD",
            self.canonical_uri, self.canonical_query
        )
    }

    fn string_to_sign(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.canonical_request().as_bytes()));
        format!(
            "{SIGNING_ALGORITHM}\n{}\n{}\n{digest}",
            self.timestamp, self.scope
        )
    }

    fn url(&self, signature_hex: &str) -> String {
        format!(
            "https://{SIGNING_HOST}{}?{}&X-Goog-Signature={signature_hex}",
            self.canonical_uri, self.canonical_query
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn request(ttl: Duration) -> V4Request {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        V4Request::new(
            "photo-bucket",
            "users/7d1f/originals/my photo.jpg",
            "signer@proj.iam.gserviceaccount.com",
            now,
            ttl,
        )
    }

    #[test]
    fn canonical_request_encodes_path_segments_and_sorted_query() {
        let req = request(Duration::from_secs(900));
        assert_eq!(
            req.canonical_uri,
            "/photo-bucket/users/7d1f/originals/my%20photo.jpg"
        );
        assert_eq!(
            req.canonical_query,
            "X-Goog-Algorithm=GOOG4-RSA-SHA256\
             &X-Goog-Credential=signer%40proj.iam.gserviceaccount.com%2F20240305%2Fauto%2Fstorage%2Fgoog4_request\
             &X-Goog-Date=20240305T140709Z\
             &X-Goog-Expires=900\
             &X-Goog-SignedHeaders=host"
        );
        assert!(
            req.canonical_request()
                .ends_with("\nhost:storage.googleapis.com\n\nhost\nUNSIGNED-PAYLOAD")
        );
    }

    #[test]
    fn string_to_sign_hashes_canonical_request() {
        let req = request(Duration::from_secs(900));
        let lines: Vec<_> = req.string_to_sign().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "GOOG4-RSA-SHA256");
        assert_eq!(lines[1], "20240305T140709Z");
        assert_eq!(lines[2], "20240305/auto/storage/goog4_request");
        assert_eq!(
            lines[3],
            hex::encode(Sha256::digest(req.canonical_request().as_bytes()))
        );
    }

    #[test]
    fn expiry_is_clamped_to_seven_days() {
        let req = request(Duration::from_secs(30 * 24 * 60 * 60));
        assert!(req.canonical_query.contains("X-Goog-Expires=604800"));
        let url = req.url("abcd");
        assert!(url.starts_with("https://storage.googleapis.com/photo-bucket/users/"));
        assert!(url.ends_with("&X-Goog-Signature=abcd"));
    }
}
