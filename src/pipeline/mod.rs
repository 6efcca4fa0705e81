//! Upload → external thumbnail function → notification handshake.
//!
//! The thumbnail function runs outside this service and writes its output to
//! the user's `thumbnails/` prefix. After an upload the tracker waits, then
//! polls for that object until it appears or the timeout passes. The
//! function may also call back directly; whichever side observes completion
//! first resolves the upload, so each upload yields one terminal notification.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::ThumbnailTiming,
    notify::{Notification, NotificationHub},
    storage::{self, SharedStore},
};

type PendingKey = (Uuid, String);

/// Pending uploads, each tagged with the id of the upload that created it so a
/// watcher left over from a deleted image never resolves a re-upload.
#[derive(Clone)]
pub struct ThumbnailTracker {
    pending: Arc<Mutex<HashMap<PendingKey, Uuid>>>,
    store: SharedStore,
    hub: NotificationHub,
    timing: ThumbnailTiming,
    url_ttl: Duration,
}

impl ThumbnailTracker {
    pub fn new(
        store: SharedStore,
        hub: NotificationHub,
        timing: ThumbnailTiming,
        url_ttl: Duration,
    ) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            store,
            hub,
            timing,
            url_ttl,
        }
    }

    /// Start waiting for the thumbnail of a freshly stored original.
    pub async fn begin(&self, user_id: Uuid, image: &str) -> JoinHandle<()> {
        let key = (user_id, image.to_string());
        let upload_id = Uuid::new_v4();
        self.pending.lock().await.insert(key.clone(), upload_id);

        let deadline = Instant::now() + self.timing.timeout;
        let tracker = self.clone();
        tokio::spawn(async move { tracker.watch(key, upload_id, deadline).await })
    }

    /// Resolve an upload reported finished by the thumbnail function.
    /// Returns false when the upload was not pending.
    pub async fn complete(&self, user_id: Uuid, image: &str) -> bool {
        let key = (user_id, image.to_string());
        if self.pending.lock().await.remove(&key).is_none() {
            return false;
        }
        info!(%user_id, image, "thumbnail reported by callback");
        self.notify_ready(&key).await;
        true
    }

    /// Forget a pending upload without notifying (the image was deleted).
    pub async fn cancel(&self, user_id: Uuid, image: &str) -> bool {
        self.pending
            .lock()
            .await
            .remove(&(user_id, image.to_string()))
            .is_some()
    }

    pub async fn is_pending(&self, user_id: Uuid, image: &str) -> bool {
        self.pending
            .lock()
            .await
            .contains_key(&(user_id, image.to_string()))
    }

    pub async fn pending_for(&self, user_id: Uuid) -> HashSet<String> {
        self.pending
            .lock()
            .await
            .keys()
            .filter(|(owner, _)| *owner == user_id)
            .map(|(_, image)| image.clone())
            .collect()
    }

    async fn watch(self, key: PendingKey, upload_id: Uuid, deadline: Instant) {
        sleep(self.timing.initial_delay).await;
        let thumbnail = storage::thumbnail_key(key.0, &key.1);

        loop {
            if !self.owns(&key, upload_id).await {
                return;
            }

            match self.store.exists(&thumbnail).await {
                Ok(true) => {
                    if self.take(&key, upload_id).await {
                        info!(user_id = %key.0, image = %key.1, "thumbnail detected");
                        self.notify_ready(&key).await;
                    }
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, user_id = %key.0, image = %key.1, "thumbnail probe failed");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            sleep(self.timing.poll_interval).await;
        }

        if self.take(&key, upload_id).await {
            warn!(user_id = %key.0, image = %key.1, "thumbnail did not appear before timeout");
            self.hub
                .notify(key.0, Notification::ThumbnailTimeout { image: key.1 })
                .await;
        }
    }

    async fn owns(&self, key: &PendingKey, upload_id: Uuid) -> bool {
        self.pending.lock().await.get(key) == Some(&upload_id)
    }

    /// Remove the entry only while it still belongs to `upload_id`.
    async fn take(&self, key: &PendingKey, upload_id: Uuid) -> bool {
        let mut pending = self.pending.lock().await;
        if pending.get(key) != Some(&upload_id) {
            return false;
        }
        pending.remove(key);
        true
    }

    async fn notify_ready(&self, key: &PendingKey) {
        let thumbnail = storage::thumbnail_key(key.0, &key.1);
        let thumbnail_url = match self.store.signed_url(&thumbnail, self.url_ttl).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(?err, key = %thumbnail, "failed to sign thumbnail url");
                None
            }
        };
        self.hub
            .notify(
                key.0,
                Notification::ThumbnailReady {
                    image: key.1.clone(),
                    thumbnail_url,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::storage::{ObjectStore, memory::MemoryStore};

    const LONG_WAIT: Duration = Duration::from_secs(3600);

    fn timing() -> ThumbnailTiming {
        ThumbnailTiming {
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }

    async fn setup() -> (
        ThumbnailTracker,
        Arc<MemoryStore>,
        Uuid,
        UnboundedReceiver<Notification>,
    ) {
        let store = Arc::new(MemoryStore::default());
        let hub = NotificationHub::new();
        let user = Uuid::new_v4();
        let (_handle, rx) = hub.register(user).await;
        let tracker =
            ThumbnailTracker::new(store.clone(), hub, timing(), Duration::from_secs(60));
        (tracker, store, user, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<Notification>) -> Option<Notification> {
        tokio::time::timeout(LONG_WAIT, rx.recv()).await.ok().flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn notifies_when_thumbnail_appears() {
        let (tracker, store, user, mut rx) = setup().await;
        let watcher = tracker.begin(user, "cat.png").await;
        assert!(tracker.is_pending(user, "cat.png").await);

        sleep(Duration::from_secs(8)).await;
        store
            .put_new(&storage::thumbnail_key(user, "cat.png"), b"t".to_vec(), "image/png")
            .await
            .unwrap();

        let expected_url = format!(
            "memory://{}?ttl=60",
            storage::thumbnail_key(user, "cat.png")
        );
        assert_eq!(
            next(&mut rx).await,
            Some(Notification::ThumbnailReady {
                image: "cat.png".into(),
                thumbnail_url: Some(expected_url),
            })
        );
        watcher.await.unwrap();
        assert!(!tracker.is_pending(user, "cat.png").await);
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_thumbnail_never_arrives() {
        let (tracker, _store, user, mut rx) = setup().await;
        let started = Instant::now();
        tracker.begin(user, "slow.png").await;

        assert_eq!(
            next(&mut rx).await,
            Some(Notification::ThumbnailTimeout {
                image: "slow.png".into()
            })
        );
        assert!(started.elapsed() >= timing().timeout);
        assert!(!tracker.is_pending(user, "slow.png").await);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_wins_and_watcher_stays_quiet() {
        let (tracker, store, user, mut rx) = setup().await;
        let watcher = tracker.begin(user, "dog.jpg").await;

        store
            .put_new(&storage::thumbnail_key(user, "dog.jpg"), b"t".to_vec(), "image/jpeg")
            .await
            .unwrap();
        assert!(tracker.complete(user, "dog.jpg").await);
        assert!(!tracker.complete(user, "dog.jpg").await);

        assert!(matches!(
            next(&mut rx).await,
            Some(Notification::ThumbnailReady { ref image, .. }) if image == "dog.jpg"
        ));
        watcher.await.unwrap();
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_uploads_notify_nothing() {
        let (tracker, _store, user, mut rx) = setup().await;
        let watcher = tracker.begin(user, "bye.gif").await;

        assert!(tracker.cancel(user, "bye.gif").await);
        watcher.await.unwrap();
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_watcher_leaves_reupload_alone() {
        let (tracker, store, user, mut rx) = setup().await;
        let stale = tracker.begin(user, "cat.png").await;
        sleep(Duration::from_secs(1)).await;
        assert!(tracker.cancel(user, "cat.png").await);

        sleep(Duration::from_secs(2)).await;
        let started = Instant::now();
        let fresh = tracker.begin(user, "cat.png").await;

        // Past the stale watcher's deadline but inside the re-upload's window.
        sleep(Duration::from_secs(29)).await;
        store
            .put_new(&storage::thumbnail_key(user, "cat.png"), b"t".to_vec(), "image/png")
            .await
            .unwrap();

        assert!(matches!(
            next(&mut rx).await,
            Some(Notification::ThumbnailReady { ref image, .. }) if image == "cat.png"
        ));
        assert!(started.elapsed() < timing().timeout + timing().poll_interval);
        stale.await.unwrap();
        fresh.await.unwrap();
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_callbacks_are_ignored() {
        let (tracker, _store, user, mut rx) = setup().await;
        assert!(!tracker.complete(user, "never-uploaded.png").await);
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_images_are_listed_per_user() {
        let (tracker, _store, user, _rx) = setup().await;
        let other = Uuid::new_v4();
        tracker.begin(user, "a.png").await;
        tracker.begin(user, "b.png").await;
        tracker.begin(other, "c.png").await;

        let pending = tracker.pending_for(user).await;
        assert_eq!(pending.len(), 2);
        assert!(pending.contains("a.png") && pending.contains("b.png"));
    }
}
