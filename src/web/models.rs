use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ImageItem {
    pub name: String,
    pub size: u64,
    pub uploaded_at: Option<String>,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub thumbnail_pending: bool,
}

#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<ImageItem>,
    pub generated_at: String,
}

#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    pub images: Vec<String>,
}
