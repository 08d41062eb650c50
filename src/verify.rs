// Upload Verifier: confirms the object landed by listing its folder

use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::http::{body_preview, read_body, with_auth};
use crate::types::SessionContext;

pub const LIST_ENDPOINT: &str = "/storage/v1/object/list";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Upload verification failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload verification failed: {status}")]
    Status { status: u16 },

    #[error("Upload verification failed: file not found in storage")]
    NotFound,

    #[error("Upload verification failed: listing response is not a JSON array")]
    Parse { body_preview: String },

    #[error("Upload verification failed: invalid listing URL {0}")]
    InvalidUrl(String),
}

/// Split a bucket-relative path on its last `/` into `(folder, filename)`.
pub fn split_object_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((folder, filename)) => (folder, filename),
        None => ("", path),
    }
}

/// `{base}/storage/v1/object/list/{bucket}/{folder}?search={filename}`
pub fn listing_url(session: &SessionContext, bucket: &str, path: &str) -> Result<Url, VerifyError> {
    let base = session.endpoint(LIST_ENDPOINT);
    let mut url = Url::parse(&base).map_err(|_| VerifyError::InvalidUrl(base.clone()))?;
    let (folder, filename) = split_object_path(path);

    url.path_segments_mut()
        .map_err(|_| VerifyError::InvalidUrl(base.clone()))?
        .push(bucket)
        .extend(folder.split('/').filter(|s| !s.is_empty()));
    url.query_pairs_mut().append_pair("search", filename);

    Ok(url)
}

pub struct Verifier {
    http: Client,
}

impl Verifier {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Number of listing entries matching the uploaded object, at least one.
    pub async fn verify(
        &self,
        session: &SessionContext,
        bucket: &str,
        path: &str,
    ) -> Result<usize, VerifyError> {
        let url = listing_url(session, bucket, path)?;
        if session.bearer_token().is_none() {
            warn!("No access token for verification");
        }

        let request = self.http.get(url).header("Accept", "application/json");
        let response = with_auth(request, session).send().await?;
        let status = response.status();
        let body = read_body(response, "").await;

        if status != StatusCode::OK {
            error!(status = status.as_u16(), body = %body_preview(&body), "VERIFY_FAIL");
            return Err(VerifyError::Status {
                status: status.as_u16(),
            });
        }

        let matches = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(entries)) => entries.len(),
            Ok(_) | Err(_) => {
                let preview = body_preview(&body);
                error!(body = %preview, "VERIFY_FAIL listing response is not a JSON array");
                return Err(VerifyError::Parse {
                    body_preview: preview,
                });
            }
        };

        if matches == 0 {
            error!(bucket = %bucket, path = %path, "VERIFY_FAIL file not found");
            return Err(VerifyError::NotFound);
        }

        info!(matches, bucket = %bucket, path = %path, "VERIFY_OK");
        Ok(matches)
    }
}
