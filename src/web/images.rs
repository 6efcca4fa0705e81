use std::collections::HashSet;

use anyhow::bail;
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    notify::Notification,
    storage::{self, ObjectInfo, ObjectStore},
    web::{
        ApiMessage, AppState,
        auth::{self, JsonAuthError},
        internal_error, json_error,
        models::{ImageItem, ImageListResponse, UploadAccepted},
        uploads::{
            IMAGE_EXTENSIONS, ImageFieldConfig, UploadedImage, process_image_form, unique_name,
        },
    },
};

pub const UPLOAD_FIELD: &str = "image";
pub const MAX_FILES_PER_UPLOAD: usize = 10;
const MAX_NAME_ATTEMPTS: usize = 8;

type ApiError = (StatusCode, Json<ApiMessage>);

pub async fn list_images(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<ImageListResponse>, ApiError> {
    let user = auth::current_user_or_json_error(&state, &jar)
        .await
        .map_err(|JsonAuthError { status, message }| json_error(status, message))?;

    let originals = list_prefix(&state, &storage::originals_prefix(user.id)).await?;
    let thumbnails: HashSet<String> = list_prefix(&state, &storage::thumbnails_prefix(user.id))
        .await?
        .iter()
        .map(|object| object.name().to_string())
        .collect();
    let pending = state.tracker().pending_for(user.id).await;

    let ttl = state.config().signed_url_ttl;
    let mut images = Vec::new();
    for entry in arrange_listing(originals, &thumbnails, &pending) {
        let name = entry.object.name().to_string();
        let url = sign_or_log(&state, &entry.object.key, ttl).await;
        let thumbnail_url = if entry.has_thumbnail {
            sign_or_log(&state, &storage::thumbnail_key(user.id, &name), ttl).await
        } else {
            None
        };
        images.push(ImageItem {
            size: entry.object.size,
            uploaded_at: entry.object.updated_at.map(|ts| ts.to_rfc3339()),
            url,
            thumbnail_url,
            thumbnail_pending: entry.pending,
            name,
        });
    }

    Ok(Json(ImageListResponse {
        images,
        generated_at: Utc::now().to_rfc3339(),
    }))
}

pub async fn upload_images(
    State(state): State<AppState>,
    jar: CookieJar,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadAccepted>), ApiError> {
    let user = auth::current_user_or_json_error(&state, &jar)
        .await
        .map_err(|JsonAuthError { status, message }| json_error(status, message))?;

    let existing: HashSet<String> = list_prefix(&state, &storage::originals_prefix(user.id))
        .await?
        .iter()
        .map(|object| object.name().to_string())
        .collect();

    let config = ImageFieldConfig {
        field_name: UPLOAD_FIELD,
        allowed_extensions: IMAGE_EXTENSIONS,
        max_files: MAX_FILES_PER_UPLOAD,
        max_bytes: state.config().max_upload_bytes,
    };
    let images = process_image_form(multipart, &config, &existing)
        .await
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.message()))?;

    let mut used = existing;
    used.extend(images.iter().map(|image| image.stored_name.clone()));

    let stored = store_batch(state.store().as_ref(), user.id, images, &mut used)
        .await
        .map_err(|err| {
            error!(?err, user_id = %user.id, "failed to store uploaded images");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Upload failed and no images were kept. Please try again.",
            )
        })?;

    for name in &stored {
        state.tracker().begin(user.id, name).await;
    }

    Ok((StatusCode::ACCEPTED, Json(UploadAccepted { images: stored })))
}

pub async fn delete_image(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(name): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    let user = auth::current_user_or_json_error(&state, &jar)
        .await
        .map_err(|JsonAuthError { status, message }| json_error(status, message))?;

    remove_owned_image(&state, user.id, &name).await?;
    Ok(Json(ApiMessage::new("Image deleted.")))
}

/// Write every image or none. A name taken since the listing (a concurrent
/// upload) moves on to the next free `_N` name.
async fn store_batch(
    store: &dyn ObjectStore,
    user_id: Uuid,
    images: Vec<UploadedImage>,
    used: &mut HashSet<String>,
) -> anyhow::Result<Vec<String>> {
    let mut stored: Vec<String> = Vec::with_capacity(images.len());

    for image in images {
        let mut name = image.stored_name.clone();
        let mut attempts = 0;
        loop {
            let key = storage::original_key(user_id, &name);
            match store
                .put_new(&key, image.bytes.clone(), &image.content_type)
                .await
            {
                Ok(true) => break,
                Ok(false) if attempts < MAX_NAME_ATTEMPTS => {
                    attempts += 1;
                    name = unique_name(image.stored_name.clone(), used);
                }
                Ok(false) => {
                    discard(store, user_id, &stored).await;
                    bail!("no free name for `{}` after {attempts} attempts", image.stored_name);
                }
                Err(err) => {
                    discard(store, user_id, &stored).await;
                    return Err(err.context(format!("failed to store `{name}`")));
                }
            }
        }
        info!(
            %user_id,
            image = %name,
            original = %image.original_name,
            "image stored, awaiting thumbnail"
        );
        stored.push(name);
    }

    Ok(stored)
}

async fn discard(store: &dyn ObjectStore, user_id: Uuid, names: &[String]) {
    for name in names {
        let key = storage::original_key(user_id, name);
        if let Err(err) = store.delete(&key).await {
            warn!(?err, %key, "failed to roll back partially stored upload");
        }
    }
}

async fn remove_owned_image(state: &AppState, user_id: Uuid, name: &str) -> Result<(), ApiError> {
    let Some(name) = storage::validate_image_name(name) else {
        return Err(json_error(StatusCode::BAD_REQUEST, "Invalid image name."));
    };

    let original = storage::original_key(user_id, name);
    let exists = state.store().exists(&original).await.map_err(|err| {
        error!(?err, %original, "failed to check image before delete");
        internal_error()
    })?;
    if !exists {
        return Err(json_error(StatusCode::NOT_FOUND, "Image not found."));
    }

    remove_object(state, &original).await?;
    remove_object(state, &storage::thumbnail_key(user_id, name)).await?;

    state.tracker().cancel(user_id, name).await;
    state
        .hub()
        .notify(
            user_id,
            Notification::ImageDeleted {
                image: name.to_string(),
            },
        )
        .await;
    info!(%user_id, image = name, "image deleted");
    Ok(())
}

async fn list_prefix(state: &AppState, prefix: &str) -> Result<Vec<ObjectInfo>, ApiError> {
    state.store().list(prefix).await.map_err(|err| {
        error!(?err, prefix, "failed to list images");
        internal_error()
    })
}

async fn remove_object(state: &AppState, key: &str) -> Result<(), ApiError> {
    state.store().delete(key).await.map_err(|err| {
        error!(?err, key, "failed to delete object");
        internal_error()
    })
}

async fn sign_or_log(state: &AppState, key: &str, ttl: std::time::Duration) -> Option<String> {
    match state.store().signed_url(key, ttl).await {
        Ok(url) => Some(url),
        Err(err) => {
            warn!(?err, key, "failed to sign image url");
            None
        }
    }
}

struct ListingEntry {
    object: ObjectInfo,
    has_thumbnail: bool,
    pending: bool,
}

/// Newest originals first, each marked with its thumbnail state.
fn arrange_listing(
    mut originals: Vec<ObjectInfo>,
    thumbnails: &HashSet<String>,
    pending: &HashSet<String>,
) -> Vec<ListingEntry> {
    originals.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.key.cmp(&b.key))
    });
    originals
        .into_iter()
        .map(|object| {
            let has_thumbnail = thumbnails.contains(object.name());
            let pending = !has_thumbnail && pending.contains(object.name());
            ListingEntry {
                object,
                has_thumbnail,
                pending,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum_extra::extract::cookie::Cookie;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::storage::memory::MemoryStore;

    fn upload(name: &str) -> UploadedImage {
        UploadedImage {
            original_name: name.to_string(),
            stored_name: name.to_string(),
            content_type: storage::content_type_for(name),
            bytes: name.as_bytes().to_vec(),
        }
    }

    /// Memory store that refuses to write keys containing `fail`.
    #[derive(Default)]
    struct RefusingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ObjectStore for RefusingStore {
        async fn put_new(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> anyhow::Result<bool> {
            if key.contains("fail") {
                bail!("disk full");
            }
            self.inner.put_new(key, bytes, content_type).await
        }

        async fn list(&self, prefix: &str) -> anyhow::Result<Vec<ObjectInfo>> {
            self.inner.list(prefix).await
        }

        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete(key).await
        }

        async fn signed_url(&self, key: &str, ttl: std::time::Duration) -> anyhow::Result<String> {
            self.inner.signed_url(key, ttl).await
        }
    }

    #[tokio::test]
    async fn names_taken_by_a_concurrent_upload_get_the_next_suffix() {
        let store = MemoryStore::default();
        let user = Uuid::new_v4();
        // Written by another request after this one listed the prefix.
        store
            .put_new(&storage::original_key(user, "cat.png"), b"other".to_vec(), "image/png")
            .await
            .unwrap();

        let mut used: HashSet<String> = ["cat.png".to_string()].into();
        let stored = store_batch(&store, user, vec![upload("cat.png")], &mut used)
            .await
            .unwrap();

        assert_eq!(stored, vec!["cat_1.png"]);
        assert!(store.exists(&storage::original_key(user, "cat_1.png")).await.unwrap());
        let listed = store.list(&storage::originals_prefix(user)).await.unwrap();
        assert_eq!(listed.iter().find(|o| o.name() == "cat.png").unwrap().size, 5);
    }

    #[tokio::test]
    async fn failed_batch_keeps_nothing() {
        let store = RefusingStore::default();
        let user = Uuid::new_v4();
        let images = vec![upload("a.png"), upload("b.png"), upload("fail.png")];
        let mut used: HashSet<String> = images.iter().map(|i| i.stored_name.clone()).collect();

        assert!(store_batch(&store, user, images, &mut used).await.is_err());
        assert!(store.list(&storage::originals_prefix(user)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_missing_image_is_not_found() {
        let state = AppState::for_tests(Arc::new(MemoryStore::default()));
        let user = Uuid::new_v4();

        let (status, _) = remove_owned_image(&state, user, "ghost.png").await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = remove_owned_image(&state, user, "../x.png").await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_removes_both_objects_and_notifies() {
        let store = Arc::new(MemoryStore::default());
        let state = AppState::for_tests(store.clone());
        let user = Uuid::new_v4();
        let (_handle, mut rx) = state.hub().register(user).await;

        for key in [
            storage::original_key(user, "dog.jpg"),
            storage::thumbnail_key(user, "dog.jpg"),
        ] {
            store.put_new(&key, b"x".to_vec(), "image/jpeg").await.unwrap();
        }
        state.tracker().begin(user, "dog.jpg").await;

        remove_owned_image(&state, user, "dog.jpg").await.unwrap();

        assert!(!store.exists(&storage::original_key(user, "dog.jpg")).await.unwrap());
        assert!(!store.exists(&storage::thumbnail_key(user, "dog.jpg")).await.unwrap());
        assert!(!state.tracker().is_pending(user, "dog.jpg").await);
        assert_eq!(
            rx.recv().await,
            Some(Notification::ImageDeleted {
                image: "dog.jpg".into()
            })
        );
    }

    #[tokio::test]
    async fn image_api_requires_a_session() {
        let state = AppState::for_tests(Arc::new(MemoryStore::default()));

        let (status, Json(body)) = list_images(State(state.clone()), CookieJar::new())
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.message, "Please sign in first.");

        let jar = CookieJar::new().add(Cookie::new(auth::SESSION_COOKIE, "not-a-session"));
        let (status, _) = delete_image(State(state), jar, Path("a.png".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    fn object(name: &str, minutes: i64) -> ObjectInfo {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        ObjectInfo {
            key: format!("users/u/originals/{name}"),
            size: 10,
            updated_at: Some(base + Duration::minutes(minutes)),
        }
    }

    #[test]
    fn listing_is_newest_first_with_thumbnail_flags() {
        let originals = vec![object("old.png", 0), object("new.png", 30), object("mid.png", 10)];
        let thumbnails: HashSet<String> = ["old.png".to_string()].into();
        let pending: HashSet<String> = ["new.png".to_string(), "old.png".to_string()].into();

        let entries = arrange_listing(originals, &thumbnails, &pending);
        let names: Vec<_> = entries.iter().map(|e| e.object.name()).collect();
        assert_eq!(names, vec!["new.png", "mid.png", "old.png"]);

        assert!(entries[0].pending && !entries[0].has_thumbnail);
        assert!(!entries[1].pending && !entries[1].has_thumbnail);
        assert!(entries[2].has_thumbnail && !entries[2].pending);
    }
}
