use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::{
    storage,
    web::{ApiMessage, AppState, json_error},
};

#[derive(Deserialize)]
pub struct FileQuery {
    token: String,
}

/// Serve an object from the local store to the holder of a signed token.
pub async fn signed_download(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Response, (StatusCode, Json<ApiMessage>)> {
    let Some(store) = state.local_store() else {
        return Err(json_error(StatusCode::NOT_FOUND, "Not found."));
    };

    let key = store.verify_token(&query.token).map_err(|err| {
        warn!(?err, "rejected download token");
        json_error(StatusCode::FORBIDDEN, "This link is invalid or has expired.")
    })?;

    let bytes = store.read(&key).await.map_err(|err| {
        error!(?err, %key, "failed to read stored object");
        json_error(StatusCode::NOT_FOUND, "File not found.")
    })?;

    let mut headers = HeaderMap::new();
    let content_type = storage::content_type_for(&key);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=300"),
    );
    if let Some(name) = key.rsplit('/').next() {
        if let Ok(disposition) = HeaderValue::from_str(&format!("inline; filename=\"{name}\"")) {
            headers.insert(header::CONTENT_DISPOSITION, disposition);
        }
    }
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );

    Ok((headers, bytes).into_response())
}
