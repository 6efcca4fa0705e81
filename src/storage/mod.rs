//! Per-user image storage.
//!
//! Every user owns the prefix `users/{user_id}/`. Uploaded originals live under
//! `originals/`, and the external thumbnail function writes a same-named object
//! under `thumbnails/`.

pub mod gcs;
pub mod local;
#[cfg(test)]
pub mod memory;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    config::{AppConfig, StorageBackendKind},
    google::TokenProvider,
};

pub use gcs::GcsStore;
pub use local::LocalStore;

const USERS_ROOT: &str = "users";
const ORIGINALS_DIR: &str = "originals";
const THUMBNAILS_DIR: &str = "thumbnails";
/// Longest image name a key segment may carry; most filesystems stop here.
pub const MAX_IMAGE_NAME_BYTES: usize = 255;

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ObjectInfo {
    /// Final path segment of the key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Operations the dashboard needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a new object. Returns false, leaving the store untouched, when
    /// `key` is already taken.
    async fn put_new(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<bool>;

    /// Objects directly under `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Removing an object that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

pub type SharedStore = Arc<dyn ObjectStore>;

/// Build the configured backend. The local store is also returned on its own
/// because the `/files` route has to verify its download tokens.
pub fn from_config(
    config: &AppConfig,
    http: reqwest::Client,
    tokens: &TokenProvider,
    url_signing_key: &str,
) -> Result<(SharedStore, Option<Arc<LocalStore>>)> {
    match &config.storage {
        StorageBackendKind::Local { root } => {
            let store = Arc::new(LocalStore::new(
                root.clone(),
                url_signing_key,
                &config.public_base_url,
            ));
            Ok((store.clone(), Some(store)))
        }
        StorageBackendKind::Gcs { bucket } => {
            let Some(key) = tokens.service_account() else {
                bail!("STORAGE_BACKEND=gcs needs GOOGLE_APPLICATION_CREDENTIALS to sign URLs");
            };
            let store = GcsStore::new(http, tokens.clone(), bucket.clone(), key.clone())
                .context("failed to initialise cloud storage client")?;
            Ok((Arc::new(store), None))
        }
    }
}

pub fn originals_prefix(user_id: Uuid) -> String {
    format!("{USERS_ROOT}/{user_id}/{ORIGINALS_DIR}/")
}

pub fn thumbnails_prefix(user_id: Uuid) -> String {
    format!("{USERS_ROOT}/{user_id}/{THUMBNAILS_DIR}/")
}

pub fn original_key(user_id: Uuid, image: &str) -> String {
    format!("{}{image}", originals_prefix(user_id))
}

pub fn thumbnail_key(user_id: Uuid, image: &str) -> String {
    format!("{}{image}", thumbnails_prefix(user_id))
}

/// Split `users/{uuid}/thumbnails/{name}` into its owner and image name.
pub fn parse_thumbnail_key(key: &str) -> Option<(Uuid, String)> {
    let mut parts = key.split('/');
    let (Some(root), Some(user), Some(dir), Some(name), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };
    if root != USERS_ROOT || dir != THUMBNAILS_DIR {
        return None;
    }
    let user_id = Uuid::parse_str(user).ok()?;
    let name = validate_image_name(name)?;
    Some((user_id, name.to_string()))
}

/// Accept only names that are already in their sanitized single-segment form.
pub fn validate_image_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.len() > MAX_IMAGE_NAME_BYTES || name.starts_with('.') {
        return None;
    }
    if name.contains('/') || name.contains('\\') {
        return None;
    }
    (sanitize_filename::sanitize(name) == name).then_some(name)
}

pub fn content_type_for(name: &str) -> String {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => mime::IMAGE_JPEG.to_string(),
        "png" => mime::IMAGE_PNG.to_string(),
        "gif" => mime::IMAGE_GIF.to_string(),
        "webp" => "image/webp".to_string(),
        _ => mime::APPLICATION_OCTET_STREAM.to_string(),
    }
}
