//! Upload Ticket Client
//!
//! Requests a short-lived upload authorization for one record and
//! normalizes whatever shape the backend answers with into an
//! [`UploadTicket`].
//!
//! ## Normalization rules
//!
//! Each ticket field is looked up through [`FIELD_RULES`]: the first alias
//! holding a truthy value wins, non-string scalars are stringified, and an
//! absent field takes its default. Only `uploadUrl` and `bucketRelativePath`
//! are required. Header problems never invalidate a ticket:
//!
//! - `null` values become `""`, booleans and numbers their text form,
//!   objects and arrays their JSON text
//! - names or values that cannot travel as HTTP headers are dropped
//! - a non-object header field, or no usable header at all, yields
//!   `{"x-upsert": "true"}`

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::http::{body_preview, read_body, with_auth};
use crate::types::{SessionContext, UploadMethod, UploadTicket};
use crate::utils::redact_url;

pub const TICKET_ENDPOINT: &str = "/functions/v1/issue-fortune-upload-ticket";

pub const DEFAULT_BUCKET: &str = "photos";
pub const DEFAULT_FORM_FIELD: &str = "file";

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Error issuing upload ticket: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to issue upload ticket: {status}")]
    Status { status: u16, body: String },

    #[error("Failed to parse ticket response: {0}")]
    Parse(String),

    #[error("Invalid upload ticket response: {}", .missing.join(", "))]
    MissingFields {
        missing: Vec<&'static str>,
        present_keys: Vec<String>,
    },
}

/// Fields of a ticket as they appear across backend versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketField {
    UploadUrl,
    BucketRelativePath,
    RequiredHeaders,
    Bucket,
    FormFieldName,
    UploadMethod,
}

pub struct FieldRule {
    pub field: TicketField,
    /// Keys tried in order
    pub aliases: &'static [&'static str],
}

pub const FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        field: TicketField::UploadUrl,
        aliases: &["url", "uploadUrl", "upload_url", "signedUrl", "signed_url"],
    },
    FieldRule {
        field: TicketField::BucketRelativePath,
        aliases: &["bucketRelativePath", "path", "filePath", "dbPath", "db_path"],
    },
    FieldRule {
        field: TicketField::RequiredHeaders,
        aliases: &["requiredHeaders", "headers"],
    },
    FieldRule {
        field: TicketField::Bucket,
        aliases: &["bucket", "bucket_name"],
    },
    FieldRule {
        field: TicketField::FormFieldName,
        aliases: &["formFieldName"],
    },
    FieldRule {
        field: TicketField::UploadMethod,
        aliases: &["uploadMethod"],
    },
];

fn aliases(field: TicketField) -> &'static [&'static str] {
    FIELD_RULES
        .iter()
        .find(|rule| rule.field == field)
        .map(|rule| rule.aliases)
        .unwrap_or(&[])
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// First truthy value among the field's aliases.
fn lookup<'a>(body: &'a Map<String, Value>, field: TicketField) -> Option<&'a Value> {
    aliases(field)
        .iter()
        .filter_map(|key| body.get(*key))
        .find(|value| is_truthy(value))
}

/// Text form of any JSON value.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn text_field(body: &Map<String, Value>, field: TicketField) -> Option<String> {
    lookup(body, field)
        .map(stringify)
        .filter(|s| !s.is_empty())
}

/// Coerce a loosely typed header object into string pairs.
pub fn normalize_headers(raw: Option<&Value>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    match raw {
        Some(Value::Object(entries)) => {
            for (key, value) in entries {
                let text = stringify(value);
                if HeaderName::from_bytes(key.as_bytes()).is_err() || HeaderValue::from_str(&text).is_err() {
                    warn!(header = %key, "Dropping ticket header that cannot be sent");
                    continue;
                }
                headers.insert(key.clone(), text);
            }
        }
        Some(other) => {
            warn!(kind = json_kind(other), "Ticket headers are not an object, ignoring");
        }
        None => {}
    }

    headers
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Normalize a parsed ticket body. Never panics; fails only when a required
/// field is missing or empty.
pub fn normalize_ticket(body: &Value) -> Result<UploadTicket, TicketError> {
    let empty = Map::new();
    let map = match body {
        Value::Object(map) => map,
        other => {
            warn!(kind = json_kind(other), "Ticket body is not an object");
            &empty
        }
    };

    let upload_url = text_field(map, TicketField::UploadUrl);
    let bucket_relative_path = text_field(map, TicketField::BucketRelativePath);

    let (upload_url, bucket_relative_path) = match (upload_url, bucket_relative_path) {
        (Some(url), Some(path)) => (url, path),
        (url, path) => {
            let mut missing = Vec::new();
            if url.is_none() {
                missing.push("url is missing or empty");
            }
            if path.is_none() {
                missing.push("path (bucketRelativePath) is missing or empty");
            }
            let mut present_keys: Vec<String> = map.keys().cloned().collect();
            present_keys.sort();
            return Err(TicketError::MissingFields { missing, present_keys });
        }
    };

    let mut required_headers = normalize_headers(lookup(map, TicketField::RequiredHeaders));
    if required_headers.is_empty() {
        debug!("No usable ticket headers, defaulting to x-upsert: true");
        required_headers.insert("x-upsert".to_string(), "true".to_string());
    }

    Ok(UploadTicket {
        upload_url,
        bucket_relative_path,
        bucket: text_field(map, TicketField::Bucket).unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
        required_headers,
        form_field_name: text_field(map, TicketField::FormFieldName)
            .unwrap_or_else(|| DEFAULT_FORM_FIELD.to_string()),
        upload_method: text_field(map, TicketField::UploadMethod)
            .map(|m| UploadMethod::from_directive(&m))
            .unwrap_or_default(),
    })
}

#[derive(Debug, Serialize)]
struct TicketRequest<'a> {
    fortune_id: &'a str,
    mime: &'a str,
}

pub struct TicketClient {
    http: Client,
}

impl TicketClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Ask the backend for an upload ticket for `fortune_id`.
    pub async fn issue(
        &self,
        session: &SessionContext,
        fortune_id: &str,
        mime: &str,
    ) -> Result<UploadTicket, TicketError> {
        if session.bearer_token().is_none() {
            warn!("No access token available for ticket request");
        }

        let request = self
            .http
            .post(session.endpoint(TICKET_ENDPOINT))
            .header("Accept", "application/json")
            .json(&TicketRequest { fortune_id, mime });

        let response = with_auth(request, session).send().await?;
        let status = response.status();
        // Error detail lives in the body, so it is read before the status is judged
        let body = read_body(response, "").await;

        if !status.is_success() {
            error!(status = status.as_u16(), body = %body_preview(&body), "TICKET_FAIL");
            return Err(TicketError::Status {
                status: status.as_u16(),
                body: body_preview(&body),
            });
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, body = %body_preview(&body), "Ticket body is not JSON");
            TicketError::Parse(e.to_string())
        })?;

        if let Some(from_ticket) = value
            .get("fortuneId")
            .or_else(|| value.get("fortune_id"))
            .and_then(Value::as_str)
        {
            if from_ticket != fortune_id {
                warn!(requested = %fortune_id, ticket = %from_ticket, "Ticket names a different record");
            }
        }

        let ticket = normalize_ticket(&value).map_err(|e| {
            if let TicketError::MissingFields { present_keys, .. } = &e {
                error!(error = %e, present_keys = ?present_keys, "Invalid upload ticket");
            }
            e
        })?;

        info!(
            upload_url = %redact_url(&ticket.upload_url),
            path = %ticket.bucket_relative_path,
            bucket = %ticket.bucket,
            method = %ticket.upload_method,
            field = %ticket.form_field_name,
            "TICKET_OK"
        );

        Ok(ticket)
    }
}
