//! Session data model: modality, provider ids, turns and the live transcript.
//!
//! The transcript is append-only while a session is live. Only the last
//! assistant turn may be mutated, and only while it is still streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::consent::ConsentStatus;

pub type SessionId = Uuid;

/// Conversation mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Voice,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Voice => "voice",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key into the provider dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One conversation instance, owned by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub modality: Modality,
    pub provider_id: ProviderId,
    pub started_at: DateTime<Utc>,
    pub consent_status: ConsentStatus,
    /// Capture paused (voice only). Survives speaking/listening round trips.
    pub muted: bool,
}

impl SessionInfo {
    pub fn new(modality: Modality, provider_id: ProviderId, consent_status: ConsentStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            modality,
            provider_id,
            started_at: Utc::now(),
            consent_status,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub streaming: bool,
}

impl Turn {
    fn frozen(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
            streaming: false,
        }
    }
}

/// Role + content pair, the shape sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub role: Role,
    pub content: String,
}

impl From<&Turn> for TurnRecord {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// Ordered sequence of turns for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a frozen user turn.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::frozen(Role::User, content.into()));
    }

    /// Append a delta to the in-flight assistant turn, opening one if needed.
    ///
    /// Returns `true` when a new turn was opened.
    pub fn append_assistant_delta(&mut self, delta: &str) -> bool {
        match self.turns.last_mut() {
            Some(turn) if turn.streaming => {
                turn.content.push_str(delta);
                false
            }
            _ => {
                self.turns.push(Turn {
                    role: Role::Assistant,
                    content: delta.to_string(),
                    timestamp: Utc::now(),
                    streaming: true,
                });
                true
            }
        }
    }

    /// Freeze the in-flight turn, if any.
    pub fn freeze_streaming(&mut self) -> Option<&Turn> {
        match self.turns.last_mut() {
            Some(turn) if turn.streaming => {
                turn.streaming = false;
                Some(turn)
            }
            _ => None,
        }
    }

    /// Drop the in-flight turn, if any.
    pub fn discard_streaming(&mut self) -> Option<Turn> {
        if self.turns.last().is_some_and(|t| t.streaming) {
            self.turns.pop()
        } else {
            None
        }
    }

    pub fn has_streaming_turn(&self) -> bool {
        self.turns.last().is_some_and(|t| t.streaming)
    }

    /// Role + content view of the frozen turns.
    pub fn records(&self) -> Vec<TurnRecord> {
        self.turns
            .iter()
            .filter(|t| !t.streaming)
            .map(TurnRecord::from)
            .collect()
    }
}
