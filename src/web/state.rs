use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::{
    config::AppConfig,
    google::{GoogleOAuth, TokenProvider},
    notify::NotificationHub,
    pipeline::ThumbnailTracker,
    secrets::{AppSecrets, SecretSource},
    storage::{self, LocalStore, SharedStore},
};

#[derive(Clone)]
pub struct AppState {
    pool: PgPool,
    config: Arc<AppConfig>,
    secrets: Arc<AppSecrets>,
    oauth: GoogleOAuth,
    store: SharedStore,
    local_store: Option<Arc<LocalStore>>,
    hub: NotificationHub,
    tracker: ThumbnailTracker,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let http = Client::new();

        let tokens = TokenProvider::from_credentials_path(
            http.clone(),
            config.credentials_path.as_deref(),
        )
        .context("failed to load google credentials")?;

        let secret_source = SecretSource::from_config(&config, http.clone(), &tokens);
        let secrets = AppSecrets::load(&secret_source)
            .await
            .context("failed to load application secrets")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        let (store, local_store) =
            storage::from_config(&config, http.clone(), &tokens, &secrets.url_signing_key)?;
        info!(backend = ?config.storage, "object storage ready");

        let oauth = GoogleOAuth::new(
            http,
            config.google_client_id.clone(),
            secrets.google_client_secret.clone(),
            config.oauth_redirect_uri(),
        );

        let hub = NotificationHub::new();
        let tracker = ThumbnailTracker::new(
            store.clone(),
            hub.clone(),
            config.thumbnail,
            config.signed_url_ttl,
        );

        Ok(Self {
            pool,
            config: Arc::new(config),
            secrets: Arc::new(secrets),
            oauth,
            store,
            local_store,
            hub,
            tracker,
        })
    }

    pub fn pool_ref(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn oauth(&self) -> &GoogleOAuth {
        &self.oauth
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn local_store(&self) -> Option<&LocalStore> {
        self.local_store.as_deref()
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn tracker(&self) -> &ThumbnailTracker {
        &self.tracker
    }

    pub fn thumbnail_hook_token(&self) -> &str {
        &self.secrets.thumbnail_hook_token
    }
}

#[cfg(test)]
impl AppState {
    pub const TEST_HOOK_TOKEN: &'static str = "hook-token-for-tests";

    /// State over `store` with a lazy pool; nothing connects until a query runs.
    pub fn for_tests(store: SharedStore) -> Self {
        let config = AppConfig::from_lookup(|name| match name {
            "DATABASE_URL" => Some("postgres://localhost/photo_dashboard_test".to_string()),
            "GOOGLE_CLIENT_ID" => Some("test-client.apps.googleusercontent.com".to_string()),
            _ => None,
        })
        .expect("test config");
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .expect("lazy pool");
        let oauth = GoogleOAuth::new(
            Client::new(),
            config.google_client_id.clone(),
            "test-client-secret",
            config.oauth_redirect_uri(),
        );
        let hub = NotificationHub::new();
        let tracker = ThumbnailTracker::new(
            store.clone(),
            hub.clone(),
            config.thumbnail,
            config.signed_url_ttl,
        );

        Self {
            pool,
            config: Arc::new(config),
            secrets: Arc::new(AppSecrets {
                google_client_secret: "test-client-secret".to_string(),
                thumbnail_hook_token: Self::TEST_HOOK_TOKEN.to_string(),
                url_signing_key: "test-signing-key".to_string(),
            }),
            oauth,
            store,
            local_store: None,
            hub,
            tracker,
        }
    }
}
