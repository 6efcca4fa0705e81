use std::{collections::BTreeMap, sync::Mutex, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;

use super::{ObjectInfo, ObjectStore};

/// In-process store standing in for cloud storage in tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_new(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<bool> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), bytes);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?;
        Ok(objects
            .iter()
            .filter(|(key, _)| {
                key.strip_prefix(prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .map(|(key, bytes)| ObjectInfo {
                key: key.clone(),
                size: bytes.len() as u64,
                updated_at: Some(Utc::now()),
            })
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?
            .contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?
            .remove(key);
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }
}
