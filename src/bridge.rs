// Host bridge: JSON envelope between the web host and the upload pipeline

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::picker::{Acquired, PickerError};
use crate::pipeline::{UploadOptions, UploadPipeline};
use crate::types::{PickedPhoto, Stage, UploadOutcome};

/// Id used when the request could not be parsed at all.
pub const INVALID_REQUEST_ID: &str = "0";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostOptions {
    #[serde(default)]
    pub fortune_id: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl From<HostOptions> for UploadOptions {
    fn from(options: HostOptions) -> Self {
        UploadOptions {
            fortune_id: options.fortune_id.unwrap_or_default(),
            access_token: options.access_token,
        }
    }
}

/// `{id, options: {fortuneId, accessToken?}}` as sent by the host
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostRequest {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub options: HostOptions,
}

impl HostRequest {
    /// Request id as a string. Numeric ids are accepted; a missing id gets a fresh one.
    pub fn request_id(&self) -> String {
        match &self.id {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostResponse {
    pub id: String,
    pub result: Value,
}

/// Result shape the host UI expects for an outcome.
pub fn outcome_envelope(outcome: &UploadOutcome) -> Value {
    match outcome {
        UploadOutcome::Success(success) => json!({
            "success": true,
            "signedUrl": success.signed_url,
            "replaced": success.replaced,
            "path": success.path,
            "width": success.width,
            "height": success.height,
            "size_bytes": success.size_bytes,
        }),
        UploadOutcome::Cancelled => json!({ "cancelled": true }),
        UploadOutcome::Failure {
            stage: Stage::Busy, ..
        } => json!({ "error": true, "stage": Stage::Busy }),
        UploadOutcome::Failure { stage, message } => json!({
            "success": false,
            "error": message,
            "stage": stage,
        }),
    }
}

/// Result of the picker-only entry point
#[derive(Debug, Clone, PartialEq)]
pub enum PickResult {
    Picked(PickedPhoto),
    Cancelled,
}

impl PickResult {
    pub fn to_json(&self) -> Value {
        match self {
            PickResult::Picked(photo) => json!({
                "bytes": base64::engine::general_purpose::STANDARD.encode(&photo.bytes),
                "mimeType": photo.mime_type,
                "width": photo.width,
                "height": photo.height,
                "cancelled": false,
            }),
            PickResult::Cancelled => json!({ "cancelled": true }),
        }
    }
}

pub struct PhotoBridge {
    pipeline: Arc<UploadPipeline>,
}

impl PhotoBridge {
    pub fn new(pipeline: Arc<UploadPipeline>) -> Self {
        Self { pipeline }
    }

    /// Handle a raw JSON request from the host.
    pub async fn handle(&self, payload: &str) -> HostResponse {
        match serde_json::from_str::<HostRequest>(payload) {
            Ok(request) => self.pick_and_upload(request).await,
            Err(e) => {
                error!(error = %e, "Invalid request payload");
                HostResponse {
                    id: INVALID_REQUEST_ID.to_string(),
                    result: json!({ "success": false, "error": "Invalid request payload" }),
                }
            }
        }
    }

    pub async fn pick_and_upload(&self, request: HostRequest) -> HostResponse {
        let id = request.request_id();
        info!(request_id = %id, "pickAndUpload called");

        let outcome = self.pipeline.pick_and_upload(request.options.into()).await;
        HostResponse {
            id,
            result: outcome_envelope(&outcome),
        }
    }

    /// Pick a photo without uploading it. Cancel-worded picker errors count
    /// as a cancellation; anything else is returned as an error.
    pub async fn pick_photo(&self) -> Result<PickResult, PickerError> {
        match self.pipeline.acquirer().acquire().await {
            Ok(Acquired::Photo(photo)) => Ok(PickResult::Picked(photo)),
            Ok(Acquired::Cancelled) => Ok(PickResult::Cancelled),
            Err(e) if e.is_cancellation() => Ok(PickResult::Cancelled),
            Err(e) => {
                error!(error = %e, "Photo pick failed");
                Err(e)
            }
        }
    }
}
