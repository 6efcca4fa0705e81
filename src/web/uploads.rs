use std::{collections::HashSet, path::Path};

use axum::extract::Multipart;

use crate::storage;

/// Result type used by the shared upload helpers.
pub type UploadResult<T> = Result<T, UploadError>;

/// Error returned when validating uploaded files. The message is user-facing.
#[derive(Debug)]
pub struct UploadError {
    message: String,
}

impl UploadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UploadError {}

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Expectations for the multipart field carrying images.
#[derive(Debug, Clone, Copy)]
pub struct ImageFieldConfig<'a> {
    pub field_name: &'a str,
    pub allowed_extensions: &'a [&'a str],
    pub max_files: usize,
    pub max_bytes: u64,
}

/// An accepted image, buffered and ready to be written to the object store.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub original_name: String,
    pub stored_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Parse multipart form data into validated images.
///
/// `existing` holds names already present in the user's storage; stored names
/// never collide with them or with each other.
pub async fn process_image_form(
    mut multipart: Multipart,
    config: &ImageFieldConfig<'_>,
    existing: &HashSet<String>,
) -> UploadResult<Vec<UploadedImage>> {
    let mut used_names = existing.clone();
    let mut images = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| UploadError::new(format!("Could not read the upload form: {err}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        if field.file_name().is_none() {
            // Plain text fields are not part of the upload contract.
            continue;
        }
        if field_name != config.field_name {
            return Err(UploadError::new(format!(
                "Unsupported file field `{field_name}`."
            )));
        }
        if images.len() >= config.max_files {
            return Err(UploadError::new(format!(
                "At most {} images can be uploaded at once.",
                config.max_files
            )));
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let extension = extension_of(&file_name);
        if !config
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            return Err(UploadError::new(format!(
                "`{file_name}` is not a supported image type ({}).",
                config.allowed_extensions.join(", ")
            )));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| UploadError::new(format!("Upload was interrupted: {err}")))?
        {
            if (bytes.len() + chunk.len()) as u64 > config.max_bytes {
                return Err(UploadError::new(format!(
                    "`{file_name}` exceeds the {} byte limit.",
                    config.max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        if bytes.is_empty() {
            return Err(UploadError::new(format!("`{file_name}` is empty.")));
        }

        let stored_name = unique_name(stored_name_for(&file_name, images.len()), &mut used_names);
        images.push(UploadedImage {
            content_type: storage::content_type_for(&stored_name),
            original_name: file_name,
            stored_name,
            bytes,
        });
    }

    if images.is_empty() {
        return Err(UploadError::new("Choose at least one image to upload."));
    }

    Ok(images)
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Sanitized storage name with a lowercase extension.
fn stored_name_for(file_name: &str, index: usize) -> String {
    let extension = extension_of(file_name);
    let sanitized = sanitize_filename::sanitize(file_name).replace(' ', "_");
    let base = match sanitized.rsplit_once('.') {
        Some((stem, ext)) if !extension.is_empty() && ext.eq_ignore_ascii_case(&extension) => {
            stem
        }
        _ => sanitized.as_str(),
    };
    let stem = match base.trim_start_matches('.') {
        "" => format!("image_{index}"),
        stem => stem.to_string(),
    };
    compose_name(&stem, "", &extension)
}

/// Reserve a name not in `used`, appending `_1`, `_2`, ... on collision.
pub(crate) fn unique_name(candidate: String, used: &mut HashSet<String>) -> String {
    if used.insert(candidate.clone()) {
        return candidate;
    }

    let (stem, extension) = split_name(&candidate);
    let mut counter = 1usize;
    loop {
        let attempt = compose_name(&stem, &format!("_{counter}"), &extension);
        if used.insert(attempt.clone()) {
            return attempt;
        }
        counter += 1;
    }
}

/// `{stem}{suffix}.{extension}`, cutting the stem so the whole name fits in
/// `MAX_IMAGE_NAME_BYTES`.
fn compose_name(stem: &str, suffix: &str, extension: &str) -> String {
    let tail = if extension.is_empty() {
        suffix.to_string()
    } else {
        format!("{suffix}.{extension}")
    };
    let budget = storage::MAX_IMAGE_NAME_BYTES.saturating_sub(tail.len());
    let mut end = stem.len().min(budget);
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{tail}", &stem[..end])
}

fn split_name(name: &str) -> (String, String) {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string();
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();
    (stem, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_names_are_sanitized_with_lowercase_extension() {
        assert_eq!(stored_name_for("Holiday Photo.JPG", 0), "Holiday_Photo.jpg");
        assert_eq!(stored_name_for("../../etc/passwd.png", 0), "etcpasswd.png");
        assert_eq!(stored_name_for("...png", 3), "image_3.png");
    }

    #[test]
    fn stored_names_pass_key_validation() {
        for raw in ["a b c.png", "weird:name?.webp", "..hidden.gif"] {
            let stored = stored_name_for(raw, 0);
            assert_eq!(storage::validate_image_name(&stored), Some(stored.as_str()));
        }
    }

    #[test]
    fn unique_name_appends_counter() {
        let mut used = HashSet::new();
        let first = unique_name("file.png".to_string(), &mut used);
        let second = unique_name("file.png".to_string(), &mut used);
        let third = unique_name("file.png".to_string(), &mut used);
        assert_eq!(first, "file.png");
        assert_eq!(second, "file_1.png");
        assert_eq!(third, "file_2.png");
    }

    #[test]
    fn unique_name_respects_existing_objects() {
        let mut used: HashSet<String> = ["cat.png".to_string(), "cat_1.png".to_string()].into();
        assert_eq!(unique_name("cat.png".to_string(), &mut used), "cat_2.png");
    }

    #[test]
    fn long_names_are_cut_to_fit_key_validation() {
        let stored = stored_name_for(&format!("{}.png", "a".repeat(300)), 0);
        assert_eq!(stored.len(), storage::MAX_IMAGE_NAME_BYTES);
        assert!(stored.ends_with("a.png"));
        assert_eq!(storage::validate_image_name(&stored), Some(stored.as_str()));

        let mut used = HashSet::new();
        let base = format!("{}.png", "b".repeat(251));
        for _ in 0..12 {
            let name = unique_name(base.clone(), &mut used);
            assert!(name.len() <= storage::MAX_IMAGE_NAME_BYTES);
            assert_eq!(storage::validate_image_name(&name), Some(name.as_str()));
        }
        assert_eq!(used.len(), 12);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let stem = "é".repeat(200);
        let name = compose_name(&stem, "_1", "jpg");
        assert!(name.len() <= storage::MAX_IMAGE_NAME_BYTES);
        assert!(name.ends_with("é_1.jpg"));
    }

    #[test]
    fn split_name_handles_extension() {
        let (stem, ext) = split_name("report.final.jpeg");
        assert_eq!(stem, "report.final");
        assert_eq!(ext, "jpeg");
    }
}
