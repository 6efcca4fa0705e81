use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow, bail};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOCAL_STORAGE_ROOT: &str = "storage/images";
const DEFAULT_SIGNED_URL_TTL_SECS: u64 = 900;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_THUMBNAIL_INITIAL_DELAY_SECS: u64 = 5;
const DEFAULT_THUMBNAIL_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_THUMBNAIL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SESSION_TTL_DAYS: i64 = 7;

/// Where named secrets (OAuth client secret, hook token, URL signing key) come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretsBackend {
    Env,
    Gcp { project_id: String },
}

/// Which object store holds user images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackendKind {
    Local { root: PathBuf },
    Gcs { bucket: String },
}

/// Timer settings for the stand-in that waits on the external thumbnail function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThumbnailTiming {
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ThumbnailTiming {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(DEFAULT_THUMBNAIL_INITIAL_DELAY_SECS),
            poll_interval: Duration::from_secs(DEFAULT_THUMBNAIL_POLL_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_THUMBNAIL_TIMEOUT_SECS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub public_base_url: String,
    pub database_url: String,
    pub google_client_id: String,
    pub secrets: SecretsBackend,
    pub storage: StorageBackendKind,
    pub credentials_path: Option<PathBuf>,
    pub signed_url_ttl: Duration,
    pub max_upload_bytes: u64,
    pub thumbnail: ThumbnailTiming,
    pub session_ttl_days: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = parse_or(&get, "PORT", DEFAULT_PORT)?;
        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let database_url = get("DATABASE_URL").context("DATABASE_URL env var is missing")?;
        let google_client_id =
            get("GOOGLE_CLIENT_ID").context("GOOGLE_CLIENT_ID env var is missing")?;

        let secrets = match get("SECRETS_BACKEND").as_deref() {
            None | Some("env") => SecretsBackend::Env,
            Some("gcp") => SecretsBackend::Gcp {
                project_id: get("GCP_PROJECT_ID")
                    .context("GCP_PROJECT_ID is required when SECRETS_BACKEND=gcp")?,
            },
            Some(other) => bail!("unsupported SECRETS_BACKEND `{other}` (expected env or gcp)"),
        };

        let storage = match get("STORAGE_BACKEND").as_deref() {
            None | Some("local") => StorageBackendKind::Local {
                root: PathBuf::from(
                    get("LOCAL_STORAGE_ROOT")
                        .unwrap_or_else(|| DEFAULT_LOCAL_STORAGE_ROOT.to_string()),
                ),
            },
            Some("gcs") => StorageBackendKind::Gcs {
                bucket: get("GCS_BUCKET")
                    .context("GCS_BUCKET is required when STORAGE_BACKEND=gcs")?,
            },
            Some(other) => bail!("unsupported STORAGE_BACKEND `{other}` (expected local or gcs)"),
        };

        let credentials_path = get("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from);

        let thumbnail = ThumbnailTiming {
            initial_delay: Duration::from_secs(parse_or(
                &get,
                "THUMBNAIL_INITIAL_DELAY_SECS",
                DEFAULT_THUMBNAIL_INITIAL_DELAY_SECS,
            )?),
            poll_interval: Duration::from_secs(parse_or(
                &get,
                "THUMBNAIL_POLL_INTERVAL_SECS",
                DEFAULT_THUMBNAIL_POLL_INTERVAL_SECS,
            )?),
            timeout: Duration::from_secs(parse_or(
                &get,
                "THUMBNAIL_TIMEOUT_SECS",
                DEFAULT_THUMBNAIL_TIMEOUT_SECS,
            )?),
        };
        if thumbnail.poll_interval.is_zero() {
            bail!("THUMBNAIL_POLL_INTERVAL_SECS must be greater than 0");
        }

        let max_upload_bytes = parse_or(&get, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        if max_upload_bytes == 0 {
            bail!("MAX_UPLOAD_BYTES must be greater than 0");
        }

        let session_ttl_days = parse_or(&get, "SESSION_TTL_DAYS", DEFAULT_SESSION_TTL_DAYS)?;
        if session_ttl_days <= 0 {
            bail!("SESSION_TTL_DAYS must be positive");
        }

        Ok(Self {
            port,
            public_base_url,
            database_url,
            google_client_id,
            secrets,
            storage,
            credentials_path,
            signed_url_ttl: Duration::from_secs(parse_or(
                &get,
                "SIGNED_URL_TTL_SECS",
                DEFAULT_SIGNED_URL_TTL_SECS,
            )?),
            max_upload_bytes,
            thumbnail,
            session_ttl_days,
        })
    }

    pub fn oauth_redirect_uri(&self) -> String {
        format!("{}/auth/google/callback", self.public_base_url)
    }

    pub fn cookies_secure(&self) -> bool {
        self.public_base_url.starts_with("https://")
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow!("invalid value for {name} (`{raw}`): {err}")),
        None => Ok(default),
    }
}
