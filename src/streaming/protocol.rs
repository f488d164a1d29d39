//! Backend streaming protocol types
//!
//! Both transports carry the same JSON frames: `{"type": ..., "payload": ...}`.
//! Realtime voice sessions run over a WebSocket; text completions arrive as a
//! chunked HTTP body with one frame per line.
//!
//! # Realtime flow
//!
//! 1. Connect to `<backend>/v1/realtime` (bearer auth)
//! 2. Send `session_start` with model, voice and prior turns
//! 3. Receive `session_ready`
//! 4. Stream microphone audio via `audio_append` (PCM16 mono, 24kHz, base64)
//! 5. Receive `user_transcript`, `token`, `audio`, `audio_level`, `turn_complete`
//! 6. Send `session_stop`, then close

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::TurnRecord;

/// Sample rate expected by the realtime endpoint, both directions.
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Frame type tags sent by the backend.
pub mod frame_type {
    pub const TOKEN: &str = "token";
    pub const TURN_COMPLETE: &str = "turn_complete";
    pub const ERROR: &str = "error";
    pub const AUDIO_LEVEL: &str = "audio_level";
    pub const USER_TRANSCRIPT: &str = "user_transcript";
    pub const AUDIO: &str = "audio";
    pub const SESSION_READY: &str = "session_ready";
}

// ============================================================================
// Client Messages (sent TO the backend)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SessionStart {
        session_id: Uuid,
        model: String,
        voice: String,
        /// Turns from before a provider switch, so the new model keeps context.
        history: Vec<TurnRecord>,
    },

    AudioAppend {
        /// Base64-encoded PCM16 little-endian audio
        audio: String,
    },

    /// Tell the backend capture is paused so it does not wait for speech.
    InputMute { muted: bool },

    SessionStop,
}

impl ClientMessage {
    pub fn session_start(
        session_id: Uuid,
        model: impl Into<String>,
        voice: impl Into<String>,
        history: Vec<TurnRecord>,
    ) -> Self {
        Self::SessionStart {
            session_id,
            model: model.into(),
            voice: voice.into(),
            history,
        }
    }

    pub fn audio_append(samples: &[i16]) -> Self {
        Self::AudioAppend {
            audio: encode_pcm16(samples),
        }
    }
}

/// Body of the text completion request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: Uuid,
    pub model: String,
    pub messages: Vec<TurnRecord>,
    pub stream: bool,
}

// ============================================================================
// Server Frames (received FROM the backend)
// ============================================================================

/// Outer shape of every backend frame. The payload is decoded per type.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// `token` / `user_transcript` payload: a bare string or `{"text": ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TextPayload {
    Bare(String),
    Object {
        #[serde(alias = "delta")]
        text: String,
    },
}

impl TextPayload {
    pub fn into_text(self) -> String {
        match self {
            TextPayload::Bare(text) | TextPayload::Object { text } => text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LevelPayload {
    Bare(f32),
    Object { level: f32 },
}

impl LevelPayload {
    pub fn level(&self) -> f32 {
        match self {
            LevelPayload::Bare(level) | LevelPayload::Object { level } => *level,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Bare(String),
    Object {
        #[serde(default, alias = "code")]
        kind: Option<String>,
        #[serde(default)]
        message: String,
    },
}

impl ErrorPayload {
    /// `(kind, message)`; the kind is `None` when the backend did not classify it.
    pub fn into_parts(self) -> (Option<String>, String) {
        match self {
            ErrorPayload::Bare(message) => (None, message),
            ErrorPayload::Object { kind, message } => (kind, message),
        }
    }
}

/// `audio` payload: base64 PCM16, bare or `{"audio": ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AudioPayload {
    Bare(String),
    Object { audio: String },
}

impl AudioPayload {
    pub fn data(&self) -> &str {
        match self {
            AudioPayload::Bare(audio) | AudioPayload::Object { audio } => audio,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionReadyPayload {
    #[serde(alias = "session_id")]
    pub session_id: Option<String>,
}

// ============================================================================
// PCM16 helpers
// ============================================================================

pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

pub fn decode_pcm16(audio: &str) -> Result<Vec<i16>, base64::DecodeError> {
    Ok(pcm16_from_bytes(&STANDARD.decode(audio)?))
}

/// Little-endian PCM16. A trailing odd byte is dropped.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
