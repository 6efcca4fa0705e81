use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::auth::TokenProvider;

const SECRET_MANAGER_BASE: &str = "https://secretmanager.googleapis.com/v1";

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

/// Thin client for Secret Manager's `versions/latest:access` call.
#[derive(Clone)]
pub struct SecretManager {
    http: Client,
    tokens: TokenProvider,
    project_id: String,
}

impl SecretManager {
    pub fn new(http: Client, tokens: TokenProvider, project_id: impl Into<String>) -> Self {
        Self {
            http,
            tokens,
            project_id: project_id.into(),
        }
    }

    pub async fn access_latest(&self, secret_id: &str) -> Result<String> {
        let url = format!(
            "{SECRET_MANAGER_BASE}/projects/{}/secrets/{}/versions/latest:access",
            self.project_id, secret_id
        );
        let token = self.tokens.access_token().await?;

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("failed to request secret `{secret_id}`"))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            bail!("secret `{secret_id}` does not exist in project {}", self.project_id);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("secret manager returned {status} for `{secret_id}`: {body}");
        }

        let body: AccessSecretVersionResponse = response
            .json()
            .await
            .with_context(|| format!("failed to decode secret `{secret_id}` response"))?;
        decode_payload(&body.payload.data)
            .with_context(|| format!("secret `{secret_id}` payload is not valid UTF-8 base64"))
    }
}

fn decode_payload(data: &str) -> Result<String> {
    let bytes = BASE64.decode(data)?;
    String::from_utf8(bytes).map_err(|err| anyhow!(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_base64_utf8() {
        assert_eq!(decode_payload("aHVudGVyMg==").unwrap(), "hunter2");
        assert!(decode_payload("not base64!").is_err());
        assert!(decode_payload(&BASE64.encode([0xff, 0xfe])).is_err());
    }
}
