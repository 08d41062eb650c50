// Finalize Client: links the stored object to its record, with retry

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::http::{body_preview, read_body, with_auth};
use crate::types::{FinalizeRequest, SessionContext};
use crate::utils::{truncate_chars, with_retry};

pub const FINALIZE_ENDPOINT: &str = "/functions/v1/finalize-fortune-photo";

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{status}")]
    Status { status: u16, body_preview: String },

    #[error("Failed to finalize photo after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FinalizeError>,
    },
}

/// Fields read from a successful finalize response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeResult {
    pub signed_url: String,
    pub replaced: bool,
}

impl FinalizeResult {
    /// Lenient parse: an empty or malformed body still counts as success.
    fn from_body(body: &str) -> Self {
        let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        Self {
            signed_url: value
                .get("signedUrl")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            replaced: value
                .get("replaced")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

pub struct FinalizeClient {
    http: Client,
    max_attempts: u32,
    backoff: Duration,
}

impl FinalizeClient {
    pub fn new(http: Client, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            http,
            max_attempts,
            backoff,
        }
    }

    /// Finalize with up to `max_attempts` tries. The request is sent
    /// unchanged on every attempt; only the last failure is reported.
    pub async fn finalize(
        &self,
        session: &SessionContext,
        request: &FinalizeRequest,
    ) -> Result<FinalizeResult, FinalizeError> {
        let max_attempts = self.max_attempts.max(1);

        with_retry(
            move |attempt| {
                info!(attempt, max_attempts, "Finalize attempt");
                self.finalize_once(session, request)
            },
            max_attempts,
            self.backoff,
        )
        .await
        .map_err(|last| {
            error!(attempts = max_attempts, error = %last, "Finalize gave up");
            FinalizeError::Exhausted {
                attempts: max_attempts,
                last: Box::new(last),
            }
        })
    }

    /// One finalize call. 200 and 201 are success.
    pub async fn finalize_once(
        &self,
        session: &SessionContext,
        request: &FinalizeRequest,
    ) -> Result<FinalizeResult, FinalizeError> {
        if session.bearer_token().is_none() {
            warn!("No access token available for finalize request");
        }

        let builder = self
            .http
            .post(session.endpoint(FINALIZE_ENDPOINT))
            .header("Accept", "application/json")
            .json(request);

        let response = with_auth(builder, session).send().await?;
        let status = response.status();
        let body = read_body(response, "").await;

        match status.as_u16() {
            200 | 201 => {
                let result = FinalizeResult::from_body(&body);
                info!(
                    signed_url = %truncate_chars(&result.signed_url, 80),
                    replaced = result.replaced,
                    "FINALIZE_OK"
                );
                Ok(result)
            }
            code => {
                let preview = body_preview(&body);
                warn!(status = code, body = %preview, "FINALIZE_FAIL");
                Err(FinalizeError::Status {
                    status: code,
                    body_preview: preview,
                })
            }
        }
    }
}
