use std::time::Duration;

use axum::{
    Json,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error};
use uuid::Uuid;

use crate::web::{
    ApiMessage, AppState,
    auth::{self, JsonAuthError},
    json_error,
};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Upgrade to the per-user notification socket. Requires a session cookie.
pub async fn notifications_socket(
    State(state): State<AppState>,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, Json<ApiMessage>)> {
    let user = auth::current_user_or_json_error(&state, &jar)
        .await
        .map_err(|JsonAuthError { status, message }| json_error(status, message))?;

    Ok(ws.on_upgrade(move |socket| serve_socket(state, user.id, socket)))
}

async fn serve_socket(state: AppState, user_id: Uuid, socket: WebSocket) {
    let (handle, mut notifications) = state.hub().register(user_id).await;
    let (mut sink, mut incoming) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            next = notifications.recv() => {
                let Some(notification) = next else {
                    // Replaced by a newer socket for the same user.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let payload = match serde_json::to_string(&notification) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(?err, "failed to encode notification");
                        continue;
                    }
                };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(?err, %user_id, "notification socket errored");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub().unregister(&handle).await;
    debug!(%user_id, "notification socket closed");
}
