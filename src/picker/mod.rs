//! Photo Acquirer
//!
//! Wraps the platform picker capability. The picker itself is an external
//! collaborator behind [`PhotoPicker`]; this module turns its loose response
//! into a [`PickedPhoto`] or a cancellation:
//!
//! 1. `None` from the picker, or a response without `webPath`/`path`, is a
//!    user cancellation, never an error.
//! 2. The location reference is resolved to bytes and a MIME type by
//!    [`ResourceLoader`].
//! 3. Missing dimensions are measured from the image header, bounded by a
//!    timeout; on timeout or decode failure the photo proceeds as `0x0`.

pub mod file;
pub mod resource;

pub use file::FilePicker;
pub use resource::{LoadedResource, ResourceLoader};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::is_cancellation_message;
use crate::types::PickedPhoto;

/// Errors raised while acquiring a photo
#[derive(Debug, Error)]
pub enum PickerError {
    /// Error reported by the platform picker, message passed through verbatim
    #[error("{0}")]
    Platform(String),

    #[error("Error reading image: {0}")]
    Resource(String),
}

impl PickerError {
    /// Whether the error text reads as a user cancellation.
    pub fn is_cancellation(&self) -> bool {
        is_cancellation_message(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PhotoSource {
    Prompt,
    Camera,
    Photos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultType {
    Uri,
    Base64,
    DataUrl,
}

/// Options handed to the platform picker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickerRequest {
    pub quality: u8,
    pub allow_editing: bool,
    pub source: PhotoSource,
    pub result_type: ResultType,
    pub correct_orientation: bool,
}

impl Default for PickerRequest {
    fn default() -> Self {
        Self {
            quality: 90,
            allow_editing: false,
            source: PhotoSource::Photos,
            result_type: ResultType::Uri,
            correct_orientation: true,
        }
    }
}

/// Raw picker result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickerResponse {
    #[serde(default)]
    pub web_path: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl PickerResponse {
    pub fn from_location(location: impl Into<String>) -> Self {
        Self {
            web_path: Some(location.into()),
            ..Default::default()
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Usable location reference, `webPath` preferred over `path`.
    pub fn location(&self) -> Option<&str> {
        [self.web_path.as_deref(), self.path.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }
}

/// Platform photo-picking capability.
///
/// `Ok(None)` means the user dismissed the picker.
#[async_trait]
pub trait PhotoPicker: Send + Sync {
    async fn pick(&self, request: &PickerRequest) -> Result<Option<PickerResponse>, PickerError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Acquired {
    Photo(PickedPhoto),
    Cancelled,
}

pub struct PhotoAcquirer {
    picker: Arc<dyn PhotoPicker>,
    loader: ResourceLoader,
    request: PickerRequest,
    probe_timeout: Duration,
}

impl PhotoAcquirer {
    pub fn new(picker: Arc<dyn PhotoPicker>, loader: ResourceLoader, probe_timeout: Duration) -> Self {
        Self {
            picker,
            loader,
            request: PickerRequest::default(),
            probe_timeout,
        }
    }

    /// Present the picker and load the chosen photo.
    pub async fn acquire(&self) -> Result<Acquired, PickerError> {
        debug!(request = ?self.request, "Opening photo picker");

        let Some(response) = self.picker.pick(&self.request).await? else {
            info!("Photo picker cancelled (no result)");
            return Ok(Acquired::Cancelled);
        };

        let Some(location) = response.location() else {
            info!("Photo picker cancelled (no webPath or path)");
            return Ok(Acquired::Cancelled);
        };

        let resource = self.loader.load(location).await?;

        let (width, height) = match response.dimensions() {
            Some(dims) => dims,
            None => probe_dimensions(resource.bytes.clone(), self.probe_timeout).await,
        };

        info!(
            width,
            height,
            bytes = resource.bytes.len(),
            mime = %resource.mime_type,
            "PICKER_OK"
        );

        Ok(Acquired::Photo(PickedPhoto {
            bytes: resource.bytes,
            mime_type: resource.mime_type,
            width,
            height,
        }))
    }
}

/// Read pixel dimensions from the image header, `(0, 0)` when the image
/// cannot be decoded or the probe outlives `limit`.
pub async fn probe_dimensions(bytes: Bytes, limit: Duration) -> (u32, u32) {
    let probe = tokio::task::spawn_blocking(move || {
        image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
    });

    match tokio::time::timeout(limit, probe).await {
        Ok(Ok(Some(dims))) => dims,
        Ok(Ok(None)) => {
            warn!("Could not read image dimensions, reporting 0x0");
            (0, 0)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Dimension probe task failed, reporting 0x0");
            (0, 0)
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "Dimension probe timed out, reporting 0x0");
            (0, 0)
        }
    }
}
