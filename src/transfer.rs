//! Byte Transfer Executor
//!
//! Sends the photo to the location named by the ticket, using the method the
//! ticket dictates:
//!
//! - `PUT`: raw bytes as the body, `Content-Type` sniffed from the bytes;
//!   a ticket-supplied `Content-Type` is ignored.
//! - `POST_MULTIPART`: one file part under the ticket's form field; the
//!   transport writes the multipart boundary, and `x-upsert: true` is added
//!   when the ticket did not set it.
//!
//! Only 200, 201 and 204 count as success. There is no retry here.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{error, info};

use crate::http::{body_preview, read_body};
use crate::types::{PickedPhoto, UploadMethod, UploadTicket};
use crate::utils::redact_url;

/// File name given to the multipart part.
pub const UPLOAD_FILE_NAME: &str = "photo.jpg";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Error uploading image: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to upload image: {status}{}", preview_suffix(.body_preview))]
    Status { status: u16, body_preview: String },
}

fn preview_suffix(preview: &str) -> String {
    let preview = preview.trim();
    if preview.is_empty() {
        String::new()
    } else {
        format!(" {preview}")
    }
}

/// What the storage backend answered to an accepted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub status: u16,
    pub method: UploadMethod,
}

/// Image MIME type from magic bytes, `image/jpeg` when unrecognized.
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, 0x50, 0x4E, 0x47, ..] => "image/png",
        [0x52, 0x49, 0x46, 0x46, ..] => "image/webp",
        _ => "image/jpeg",
    }
}

fn is_accepted(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 201 | 204)
}

/// Ticket headers as a `HeaderMap`, minus any `Content-Type`.
fn ticket_headers(ticket: &UploadTicket) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &ticket.required_headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        if name == CONTENT_TYPE {
            continue;
        }
        headers.insert(name, value);
    }
    headers
}

pub struct TransferExecutor {
    http: Client,
}

impl TransferExecutor {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn transfer(
        &self,
        ticket: &UploadTicket,
        photo: &PickedPhoto,
    ) -> Result<TransferReceipt, TransferError> {
        let method = ticket.upload_method;
        let mut headers = ticket_headers(ticket);

        let request = match method {
            UploadMethod::Put => {
                let detected = sniff_image_mime(&photo.bytes);
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(detected));
                info!(
                    method = "PUT",
                    url = %redact_url(&ticket.upload_url),
                    mime = detected,
                    bytes = photo.bytes.len(),
                    "UPLOAD_START"
                );

                self.http
                    .put(&ticket.upload_url)
                    .headers(headers)
                    .body(photo.bytes.clone())
            }
            UploadMethod::PostMultipart => {
                if !headers.contains_key("x-upsert") {
                    headers.insert("x-upsert", HeaderValue::from_static("true"));
                }

                let part = Part::bytes(photo.bytes.to_vec())
                    .file_name(UPLOAD_FILE_NAME)
                    .mime_str(&photo.mime_type)
                    .or_else(|_| {
                        Part::bytes(photo.bytes.to_vec())
                            .file_name(UPLOAD_FILE_NAME)
                            .mime_str(sniff_image_mime(&photo.bytes))
                    })?;
                let form = Form::new().part(ticket.form_field_name.clone(), part);
                info!(
                    method = "POST",
                    url = %redact_url(&ticket.upload_url),
                    field = %ticket.form_field_name,
                    bytes = photo.bytes.len(),
                    "UPLOAD_START"
                );

                self.http
                    .post(&ticket.upload_url)
                    .headers(headers)
                    .multipart(form)
            }
        };

        let response = request.send().await?;
        let status = response.status();
        let body = read_body(response, "Could not read response").await;
        let preview = body_preview(&body);

        if !is_accepted(status) {
            error!(status = status.as_u16(), method = %method, body = %preview, "UPLOAD_FAIL");
            return Err(TransferError::Status {
                status: status.as_u16(),
                body_preview: preview,
            });
        }

        info!(status = status.as_u16(), method = %method, body = %preview, "UPLOAD_OK");
        Ok(TransferReceipt {
            status: status.as_u16(),
            method,
        })
    }
}
