use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use super::{ObjectInfo, ObjectStore};

/// Claims carried by a local download token.
#[derive(Debug, Serialize, Deserialize)]
struct FileClaims {
    key: String,
    exp: i64,
}

/// Filesystem-backed store for development. Objects are plain files under
/// `root`; signed URLs point back at this service's `/files` route.
pub struct LocalStore {
    root: PathBuf,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    base_url: String,
}

impl LocalStore {
    pub fn new(root: PathBuf, signing_key: &str, base_url: &str) -> Self {
        Self {
            root,
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Check a download token and return the object key it grants.
    pub fn verify_token(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = jsonwebtoken::decode::<FileClaims>(token, &self.decoding_key, &validation)
            .context("download token rejected")?;
        Ok(data.claims.key)
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_end_matches('/'));
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !safe {
            bail!("object key `{key}` escapes the storage root");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_new(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", path.display()));
            }
        };
        file.write_all(&bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        file.flush().await?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.resolve(prefix)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", dir.display()));
            }
        };

        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            objects.push(ObjectInfo {
                key: format!("{prefix}{name}"),
                size: metadata.len(),
                updated_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.resolve(key)?;
        let claims = FileClaims {
            key: key.to_string(),
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to sign download token")?;
        Ok(format!("{}/files?token={token}", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> LocalStore {
        LocalStore::new(dir.to_path_buf(), "test-signing-key", "http://localhost:8080/")
    }

    #[tokio::test]
    async fn put_list_exists_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(
            store
                .put_new("users/u1/originals/b.png", b"png".to_vec(), "image/png")
                .await
                .unwrap()
        );
        assert!(
            store
                .put_new("users/u1/originals/a.jpg", b"jpeg!".to_vec(), "image/jpeg")
                .await
                .unwrap()
        );

        let listed = store.list("users/u1/originals/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["users/u1/originals/a.jpg", "users/u1/originals/b.png"]
        );
        assert_eq!(listed[0].size, 5);
        assert_eq!(listed[0].name(), "a.jpg");

        assert!(store.exists("users/u1/originals/a.jpg").await.unwrap());
        store.delete("users/u1/originals/a.jpg").await.unwrap();
        assert!(!store.exists("users/u1/originals/a.jpg").await.unwrap());
        store.delete("users/u1/originals/a.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn existing_objects_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = "users/u1/originals/cat.png";

        assert!(store.put_new(key, b"first".to_vec(), "image/png").await.unwrap());
        assert!(!store.put_new(key, b"second".to_vec(), "image/png").await.unwrap());
        assert_eq!(store.read(key).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn listing_a_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let listed = store(dir.path()).list("users/nobody/originals/").await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.put_new("../escape.png", Vec::new(), "image/png").await.is_err());
        assert!(store.exists("/etc/passwd").await.is_err());
        assert!(store.read("users/../../x").await.is_err());
    }

    #[tokio::test]
    async fn signed_urls_verify_and_reject_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let url = store
            .signed_url("users/u1/originals/a.jpg", Duration::from_secs(60))
            .await
            .unwrap();
        let token = url
            .strip_prefix("http://localhost:8080/files?token=")
            .unwrap();
        assert_eq!(
            store.verify_token(token).unwrap(),
            "users/u1/originals/a.jpg"
        );

        let other = LocalStore::new(dir.path().to_path_buf(), "another-key", "http://x");
        assert!(other.verify_token(token).is_err());
        assert!(store.verify_token(&format!("{token}x")).is_err());
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let claims = FileClaims {
            key: "users/u1/originals/a.jpg".into(),
            exp: Utc::now().timestamp() - 10,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-signing-key"),
        )
        .unwrap();
        assert!(store.verify_token(&token).is_err());
    }
}
