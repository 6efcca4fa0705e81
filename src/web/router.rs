use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};

use crate::web::{AppState, auth, files, hooks, images, landing, notifications};

const ROBOTS_TXT_BODY: &str = include_str!("../../robots.txt");
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn build_router(state: AppState) -> Router {
    let upload_limit = upload_body_limit(state.config().max_upload_bytes);

    let image_api = Router::new()
        .route(
            "/api/images",
            get(images::list_images).post(images::upload_images),
        )
        .route("/api/images/:name", delete(images::delete_image))
        .layer(DefaultBodyLimit::max(upload_limit));

    Router::new()
        .route("/", get(landing::landing_page))
        .route("/auth/google", get(auth::start_google_login))
        .route("/auth/google/callback", get(auth::google_callback))
        .route("/logout", post(auth::logout))
        .route("/api/me", get(auth::me))
        .merge(image_api)
        .route("/api/hooks/thumbnail", post(hooks::thumbnail_ready))
        .route("/ws", get(notifications::notifications_socket))
        .route("/files", get(files::signed_download))
        .route("/healthz", get(healthz))
        .route("/robots.txt", get(robots_txt))
        .with_state(state)
}

fn upload_body_limit(max_upload_bytes: u64) -> usize {
    let per_file = usize::try_from(max_upload_bytes).unwrap_or(usize::MAX);
    per_file
        .saturating_mul(images::MAX_FILES_PER_UPLOAD)
        .saturating_add(MULTIPART_OVERHEAD_BYTES)
}

async fn robots_txt() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.to_string())],
        ROBOTS_TXT_BODY,
    )
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
