//! Per-user push notifications.
//!
//! Each signed-in user has at most one live WebSocket. Messages for a user
//! without an open socket are dropped; nothing is queued for later.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ThumbnailReady {
        image: String,
        thumbnail_url: Option<String>,
    },
    ThumbnailTimeout {
        image: String,
    },
    ImageDeleted {
        image: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::ThumbnailReady { .. } => "thumbnail_ready",
            Notification::ThumbnailTimeout { .. } => "thumbnail_timeout",
            Notification::ImageDeleted { .. } => "image_deleted",
        }
    }
}

/// Identifies one registered socket so that its cleanup cannot evict a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub user_id: Uuid,
    pub connection_id: Uuid,
}

struct Connection {
    id: Uuid,
    sender: mpsc::UnboundedSender<Notification>,
}

#[derive(Clone, Default)]
pub struct NotificationHub {
    connections: Arc<RwLock<HashMap<Uuid, Connection>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket for `user_id`, replacing (and thereby closing) any
    /// socket the user already had open.
    pub async fn register(
        &self,
        user_id: Uuid,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();

        let replaced = {
            let mut guard = self.connections.write().await;
            guard.insert(
                user_id,
                Connection {
                    id: connection_id,
                    sender,
                },
            )
        };

        if let Some(previous) = replaced {
            info!(%user_id, replaced = %previous.id, "replacing existing notification socket");
        } else {
            debug!(%user_id, %connection_id, "notification socket registered");
        }

        (
            ConnectionHandle {
                user_id,
                connection_id,
            },
            receiver,
        )
    }

    /// Drop the user's entry if it still belongs to `handle`.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut guard = self.connections.write().await;
        let owned = guard
            .get(&handle.user_id)
            .is_some_and(|connection| connection.id == handle.connection_id);
        if owned {
            guard.remove(&handle.user_id);
            debug!(user_id = %handle.user_id, "notification socket unregistered");
        }
        owned
    }

    /// Deliver to the user's open socket. Returns false when nothing was listening.
    pub async fn notify(&self, user_id: Uuid, notification: Notification) -> bool {
        let kind = notification.kind();
        let delivered = {
            let guard = self.connections.read().await;
            guard
                .get(&user_id)
                .is_some_and(|connection| connection.sender.send(notification).is_ok())
        };

        if delivered {
            debug!(%user_id, kind, "notification delivered");
        } else {
            debug!(%user_id, kind, "no open socket, notification dropped");
        }
        delivered
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
