//! Error taxonomy for the session engine.
//!
//! `SessionError` is what the public API returns. Provider failures never
//! cross that boundary: they are folded into the `error` state as a
//! [`SessionFault`] so the UI has a single place to render recovery.

use serde::Serialize;
use thiserror::Error;

use crate::consent::ConsentStatus;
use crate::session::{Modality, ProviderId};
use crate::state_machine::Phase;

/// Errors returned by `SessionEngine` operations.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("a {modality} session is already active")]
    AlreadyActive { modality: Modality },

    #[error("consent is required before starting a {modality} session (current: {status})")]
    ConsentRequired {
        modality: Modality,
        status: ConsentStatus,
    },

    /// Operation is invalid in the current state. Recovered locally as a no-op.
    #[error("session is busy ({phase})")]
    Busy { phase: Phase },

    #[error("{operation} is not supported for {modality} sessions")]
    NotSupported {
        operation: &'static str,
        modality: Modality,
    },

    #[error("no {modality} provider registered as '{provider_id}'")]
    UnknownProvider {
        provider_id: ProviderId,
        modality: Modality,
    },

    #[error("message is empty")]
    EmptyMessage,

    #[error("transcript is empty, nothing to finish")]
    EmptyTranscript,

    /// Non-fatal: the live session is unaffected and `finish()` may be retried.
    #[error("failed to finalize session: {0}")]
    FinalizeFailed(#[from] FinalizeError),

    #[error("session engine has shut down")]
    EngineClosed,
}

impl SessionError {
    /// True for errors the UI should treat as a silent no-op.
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionError::Busy { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Stream stopped delivering data without completing or failing.
    Stalled,
    ConnectionLost,
    /// Backend refused the request (auth, quota, invalid input).
    Rejected,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Stalled => "stalled",
            ProviderErrorKind::ConnectionLost => "connection_lost",
            ProviderErrorKind::Rejected => "rejected",
        }
    }

    /// Parse the `kind` field of an error frame. Unknown kinds count as lost connections.
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "stalled" => ProviderErrorKind::Stalled,
            "rejected" | "unauthorized" | "forbidden" | "invalid_request" | "rate_limited" => {
                ProviderErrorKind::Rejected
            }
            _ => ProviderErrorKind::ConnectionLost,
        }
    }
}

/// Failure reported by a provider adapter.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} provider error: {message}", kind.as_str())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn stalled(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Stalled, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ConnectionLost, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Rejected, message)
    }
}

/// Errors from the one-shot finalize call.
#[derive(Debug, Clone, Error)]
pub enum FinalizeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("finalize request timed out")]
    Timeout,
    #[error("backend error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("failed to parse finalize response: {0}")]
    Parse(String),
}

/// What the UI sees while the session sits in the `error` state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFault {
    pub kind: ProviderErrorKind,
    /// Diagnostic detail, suitable for logs.
    pub detail: String,
    /// Short, user-presentable message.
    pub message: String,
}

impl SessionFault {
    pub fn from_provider(error: &ProviderError) -> Self {
        let message = match error.kind {
            ProviderErrorKind::Stalled => {
                "The conversation stopped responding. You can try again or switch models."
            }
            ProviderErrorKind::ConnectionLost => {
                "The connection was lost. Check your network and try again."
            }
            ProviderErrorKind::Rejected => {
                "The service could not start this conversation. Please try again later."
            }
        };
        Self {
            kind: error.kind,
            detail: error.message.clone(),
            message: message.to_string(),
        }
    }
}
