// Type definitions and enums

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Picker,
    Ticket,
    Upload,
    Verify,
    Finalize,
    Busy,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Picker => write!(f, "picker"),
            Stage::Ticket => write!(f, "ticket"),
            Stage::Upload => write!(f, "upload"),
            Stage::Verify => write!(f, "verify"),
            Stage::Finalize => write!(f, "finalize"),
            Stage::Busy => write!(f, "busy"),
        }
    }
}

/// A photo as handed over by the acquirer.
#[derive(Debug, Clone, PartialEq)]
pub struct PickedPhoto {
    pub bytes: Bytes,
    pub mime_type: String,
    /// Pixel width, 0 when unknown
    pub width: u32,
    /// Pixel height, 0 when unknown
    pub height: u32,
}

impl PickedPhoto {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// How the ticket wants the bytes delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadMethod {
    Put,
    #[default]
    PostMultipart,
}

impl UploadMethod {
    /// Interpret a backend directive. Anything other than `PUT` falls back to multipart.
    pub fn from_directive(directive: &str) -> Self {
        if directive.trim().eq_ignore_ascii_case("PUT") {
            UploadMethod::Put
        } else {
            UploadMethod::PostMultipart
        }
    }
}

impl std::fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadMethod::Put => write!(f, "PUT"),
            UploadMethod::PostMultipart => write!(f, "POST_MULTIPART"),
        }
    }
}

/// Normalized upload authorization issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub upload_url: String,
    pub bucket_relative_path: String,
    pub bucket: String,
    pub required_headers: BTreeMap<String, String>,
    pub form_field_name: String,
    pub upload_method: UploadMethod,
}

/// Payload for the finalize endpoint. Unknown dimensions and sizes go out as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeRequest {
    pub fortune_id: String,
    pub bucket: String,
    pub path: String,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_bytes: Option<u64>,
}

impl FinalizeRequest {
    pub fn new(fortune_id: &str, ticket: &UploadTicket, photo: &PickedPhoto) -> Self {
        let non_zero = |v: u32| (v > 0).then_some(v);
        let size = photo.size_bytes();

        Self {
            fortune_id: fortune_id.to_string(),
            bucket: ticket.bucket.clone(),
            path: ticket.bucket_relative_path.clone(),
            mime: photo.mime_type.clone(),
            width: non_zero(photo.width),
            height: non_zero(photo.height),
            size_bytes: (size > 0).then_some(size),
        }
    }
}

/// Result fields of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSuccess {
    pub signed_url: String,
    pub replaced: bool,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// Terminal value of one pick-and-upload invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success(UploadSuccess),
    Cancelled,
    Failure { stage: Stage, message: String },
}

impl UploadOutcome {
    pub fn failure(stage: Stage, message: impl Into<String>) -> Self {
        UploadOutcome::Failure {
            stage,
            message: message.into(),
        }
    }

    pub fn busy() -> Self {
        Self::failure(Stage::Busy, "Upload already in progress")
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadOutcome::Cancelled)
    }

    /// Stage of a failure, `None` for success and cancellation.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            UploadOutcome::Failure { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Backend location and credentials of the host web session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub base_url: String,
    pub access_token: Option<String>,
    pub anon_key: Option<String>,
}

impl SessionContext {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: None,
            anon_key: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_anon_key(mut self, key: impl Into<String>) -> Self {
        self.anon_key = Some(key.into());
        self
    }

    /// Absolute URL for a backend path such as `/functions/v1/...`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.anon_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Supplies the session at invocation time. The pipeline never caches it.
pub trait SessionSource: Send + Sync {
    fn current(&self) -> SessionContext;
}

/// Session fixed at construction, used by the CLI and tests.
#[derive(Debug, Clone)]
pub struct StaticSession(pub SessionContext);

impl SessionSource for StaticSession {
    fn current(&self) -> SessionContext {
        self.0.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type AppResult<T> = std::result::Result<T, AppError>;
