use std::env;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    config::{AppConfig, SecretsBackend},
    google::{SecretManager, TokenProvider},
};

/// A secret known both by its Secret Manager id and its env-var fallback.
#[derive(Debug, Clone, Copy)]
pub struct SecretName {
    pub id: &'static str,
    pub env_var: &'static str,
}

pub const GOOGLE_CLIENT_SECRET: SecretName = SecretName {
    id: "google-client-secret",
    env_var: "GOOGLE_CLIENT_SECRET",
};
pub const THUMBNAIL_HOOK_TOKEN: SecretName = SecretName {
    id: "thumbnail-hook-token",
    env_var: "THUMBNAIL_HOOK_TOKEN",
};
pub const URL_SIGNING_KEY: SecretName = SecretName {
    id: "url-signing-key",
    env_var: "URL_SIGNING_KEY",
};

#[derive(Clone)]
pub enum SecretSource {
    Env,
    SecretManager(SecretManager),
}

impl SecretSource {
    pub fn from_config(config: &AppConfig, http: reqwest::Client, tokens: &TokenProvider) -> Self {
        match &config.secrets {
            SecretsBackend::Env => SecretSource::Env,
            SecretsBackend::Gcp { project_id } => SecretSource::SecretManager(SecretManager::new(
                http,
                tokens.clone(),
                project_id.clone(),
            )),
        }
    }

    pub async fn resolve(&self, name: SecretName) -> Result<String> {
        let raw = match self {
            SecretSource::Env => env::var(name.env_var)
                .with_context(|| format!("{} env var is missing", name.env_var))?,
            SecretSource::SecretManager(client) => client.access_latest(name.id).await?,
        };
        normalize_secret(&raw).with_context(|| format!("secret `{}` is empty", name.id))
    }
}

/// Secrets resolved once at startup.
#[derive(Clone)]
pub struct AppSecrets {
    pub google_client_secret: String,
    pub thumbnail_hook_token: String,
    pub url_signing_key: String,
}

impl AppSecrets {
    pub async fn load(source: &SecretSource) -> Result<Self> {
        let secrets = Self {
            google_client_secret: source.resolve(GOOGLE_CLIENT_SECRET).await?,
            thumbnail_hook_token: source.resolve(THUMBNAIL_HOOK_TOKEN).await?,
            url_signing_key: source.resolve(URL_SIGNING_KEY).await?,
        };
        let backend = match source {
            SecretSource::Env => "env",
            SecretSource::SecretManager(_) => "secret-manager",
        };
        info!(backend, "loaded application secrets");
        Ok(secrets)
    }
}

// Secret Manager payloads are commonly uploaded with a trailing newline.
fn normalize_secret(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    (!trimmed.trim().is_empty()).then(|| trimmed.to_string())
}
