// Resolves a picker location reference to raw bytes and a MIME type

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::PickerError;

/// Used when the resource does not name an image type.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedResource {
    pub bytes: Bytes,
    pub mime_type: String,
}

/// Loads `data:`, `http(s)://`, `file://` and plain filesystem references.
#[derive(Debug, Clone)]
pub struct ResourceLoader {
    http: Client,
}

impl ResourceLoader {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn load(&self, location: &str) -> Result<LoadedResource, PickerError> {
        let location = location.trim();

        if let Some(rest) = location.strip_prefix("data:") {
            return parse_data_url(rest);
        }

        if location.starts_with("http://") || location.starts_with("https://") {
            return self.fetch_remote(location).await;
        }

        if location.starts_with("file://") {
            let path = Url::parse(location)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| PickerError::Resource(format!("invalid file URL: {location}")))?;
            return read_file(&path).await;
        }

        read_file(&PathBuf::from(location)).await
    }

    async fn fetch_remote(&self, url: &str) -> Result<LoadedResource, PickerError> {
        debug!(url = %crate::utils::redact_url(url), "Fetching picked image");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PickerError::Resource(e.to_string()))?;

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(image_mime);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PickerError::Resource(e.to_string()))?;

        Ok(LoadedResource {
            bytes,
            mime_type: mime_type.unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string()),
        })
    }
}

async fn read_file(path: &Path) -> Result<LoadedResource, PickerError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PickerError::Resource(format!("{}: {}", path.display(), e)))?;

    let mime_type = mime_guess::from_path(path)
        .first()
        .filter(|m| m.type_() == mime::IMAGE)
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());

    Ok(LoadedResource {
        bytes: Bytes::from(bytes),
        mime_type,
    })
}

/// Parse the part of a data URL after `data:`.
fn parse_data_url(rest: &str) -> Result<LoadedResource, PickerError> {
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| PickerError::Resource("malformed data URL".to_string()))?;

    let is_base64 = header
        .split(';')
        .skip(1)
        .any(|param| param.eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        BASE64
            .decode(payload.trim())
            .map_err(|e| PickerError::Resource(format!("invalid base64 data URL: {e}")))?
    } else {
        payload.as_bytes().to_vec()
    };

    let mime_type = header
        .split(';')
        .next()
        .and_then(image_mime)
        .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());

    Ok(LoadedResource {
        bytes: Bytes::from(bytes),
        mime_type,
    })
}

/// Essence of `raw` when it parses as an `image/*` media type.
fn image_mime(raw: &str) -> Option<String> {
    raw.trim()
        .parse::<mime::Mime>()
        .ok()
        .filter(|m| m.type_() == mime::IMAGE)
        .map(|m| m.essence_str().to_string())
}
