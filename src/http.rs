//! Shared HTTP plumbing for backend calls.

use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// No overall timeout: streaming bodies are bounded by the stall watchdog,
/// one-shot calls set their own per request.
pub(crate) fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client")
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiErrorResponse {
    Nested { error: ApiErrorDetail },
    Flat { message: String },
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Best-effort error message out of a non-success response body.
pub(crate) fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(ApiErrorResponse::Nested { error }) => error.message,
        Ok(ApiErrorResponse::Flat { message }) => message,
        Err(_) => body.trim().to_string(),
    }
}
