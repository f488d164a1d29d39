//! Session finalizer: turns the live transcript into a durable summary with
//! one request to the backend. Independent of the live stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::credentials::bearer;
use crate::error::FinalizeError;
use crate::http::{api_error_message, http_client};
use crate::session::{SessionId, TurnRecord};

/// Durable artifact of `finish()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub key_points: Vec<String>,
    pub turn_count: usize,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Finalizer: Send + Sync + 'static {
    /// Extract the key points of `turns`, in order.
    async fn finalize(
        &self,
        session_id: SessionId,
        turns: &[TurnRecord],
    ) -> Result<Vec<String>, FinalizeError>;
}

#[derive(Serialize)]
struct FinalizeRequest<'a> {
    turns: &'a [TurnRecord],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeResponse {
    important_points: Vec<String>,
}

/// POSTs `{turns}` to the finalize endpoint, expects `{importantPoints}`.
pub struct HttpFinalizer {
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpFinalizer {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            token,
            timeout,
        }
    }
}

#[async_trait]
impl Finalizer for HttpFinalizer {
    async fn finalize(
        &self,
        session_id: SessionId,
        turns: &[TurnRecord],
    ) -> Result<Vec<String>, FinalizeError> {
        log::info!(
            "Finalizer: summarizing session {} ({} turns)",
            session_id,
            turns.len()
        );

        let mut request = http_client()
            .post(&self.url)
            .timeout(self.timeout)
            .json(&FinalizeRequest { turns });
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, bearer(token));
        }

        let response = request.send().await.map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = api_error_message(&body);
            log::error!("Finalizer: HTTP {}: {}", status.as_u16(), message);
            return Err(FinalizeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await.map_err(map_request_error)?;
        let parsed: FinalizeResponse =
            serde_json::from_str(&body).map_err(|e| FinalizeError::Parse(e.to_string()))?;

        log::info!(
            "Finalizer: {} key points for session {}",
            parsed.important_points.len(),
            session_id
        );
        Ok(parsed.important_points)
    }
}

fn map_request_error(e: reqwest::Error) -> FinalizeError {
    if e.is_timeout() {
        FinalizeError::Timeout
    } else {
        FinalizeError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[test]
    fn request_body_shape() {
        let turns = vec![
            TurnRecord {
                role: Role::User,
                content: "I slept badly".into(),
            },
            TurnRecord {
                role: Role::Assistant,
                content: "Let's look at that".into(),
            },
        ];
        let json = serde_json::to_value(FinalizeRequest { turns: &turns }).unwrap();
        assert_eq!(json["turns"][0]["role"], "user");
        assert_eq!(json["turns"][1]["content"], "Let's look at that");
    }

    #[test]
    fn response_parsing() {
        let parsed: FinalizeResponse =
            serde_json::from_str(r#"{"importantPoints":["sleep","stress"]}"#).unwrap();
        assert_eq!(parsed.important_points, vec!["sleep", "stress"]);
        assert!(serde_json::from_str::<FinalizeResponse>(r#"{"points":[]}"#).is_err());
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_error() {
        let finalizer = HttpFinalizer::new(
            "http://127.0.0.1:9/v1/sessions/finalize",
            None,
            Duration::from_secs(2),
        );
        let turns = vec![TurnRecord {
            role: Role::User,
            content: "hi".into(),
        }];
        let err = finalizer
            .finalize(uuid::Uuid::new_v4(), &turns)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FinalizeError::Network(_) | FinalizeError::Timeout
        ));
    }
}
