use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    storage,
    web::{ApiMessage, AppState, auth::constant_time_eq, json_error},
};

/// Body posted by the thumbnail function once it has written its output.
#[derive(Debug, Deserialize)]
pub struct ThumbnailHook {
    pub object: String,
}

// The body stays raw until the caller is authenticated.
pub async fn thumbnail_ready(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiMessage>), (StatusCode, Json<ApiMessage>)> {
    let authorized = bearer_token(&headers).is_some_and(|token| {
        constant_time_eq(token.as_bytes(), state.thumbnail_hook_token().as_bytes())
    });
    if !authorized {
        warn!("rejected thumbnail callback with missing or wrong token");
        return Err(json_error(StatusCode::UNAUTHORIZED, "Invalid hook token."));
    }

    let hook: ThumbnailHook = serde_json::from_slice(&body).map_err(|err| {
        warn!(?err, "malformed thumbnail callback body");
        json_error(
            StatusCode::BAD_REQUEST,
            "Body must be a JSON object with an `object` key.",
        )
    })?;

    let Some((user_id, image)) = storage::parse_thumbnail_key(&hook.object) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "Object is not a user thumbnail.",
        ));
    };

    let resolved = state.tracker().complete(user_id, &image).await;
    let listening = state.hub().is_connected(user_id).await;
    info!(%user_id, %image, resolved, listening, "thumbnail callback received");

    Ok((StatusCode::ACCEPTED, Json(ApiMessage::new("Accepted."))))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
