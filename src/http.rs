// Shared HTTP plumbing for the backend clients

use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;

use crate::config::HttpConfig;
use crate::types::{AppResult, SessionContext};

/// Response bodies are previewed in errors and logs up to this many characters.
pub const BODY_PREVIEW_CHARS: usize = 300;

/// Build a client with the configured connect timeout and the given overall timeout.
pub fn build_client(config: &HttpConfig, timeout: Duration) -> AppResult<Client> {
    let client = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(timeout)
        .build()?;
    Ok(client)
}

/// Attach `Authorization: Bearer` and `apikey` when the session has them.
pub fn with_auth(request: RequestBuilder, session: &SessionContext) -> RequestBuilder {
    let mut request = request;
    if let Some(token) = session.bearer_token() {
        request = request.bearer_auth(token);
    }
    if let Some(key) = session.api_key() {
        request = request.header("apikey", key);
    }
    request
}

/// First [`BODY_PREVIEW_CHARS`] characters of a body.
pub fn body_preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// Read the full body as text. A body that cannot be read yields `fallback`.
pub async fn read_body(response: Response, fallback: &str) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_preview_caps_length() {
        let long = "x".repeat(1000);
        assert_eq!(body_preview(&long).len(), BODY_PREVIEW_CHARS);
        assert_eq!(body_preview("short"), "short");
    }

    #[tokio::test]
    async fn test_with_auth_sets_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("authorization", "Bearer tok")
            .match_header("apikey", "anon")
            .with_status(204)
            .create_async()
            .await;

        let session = SessionContext::new(server.url())
            .with_access_token("tok")
            .with_anon_key("anon");
        let client = build_client(&HttpConfig::default(), Duration::from_secs(5)).unwrap();
        let response = with_auth(client.get(session.endpoint("/ping")), &session)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 204);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_with_auth_skips_missing_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("authorization", mockito::Matcher::Missing)
            .match_header("apikey", mockito::Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;

        let session = SessionContext::new(server.url()).with_access_token("");
        let client = build_client(&HttpConfig::default(), Duration::from_secs(5)).unwrap();
        with_auth(client.get(session.endpoint("/ping")), &session)
            .send()
            .await
            .unwrap();

        mock.assert_async().await;
    }
}
