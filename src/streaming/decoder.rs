//! Stream decoder: raw frames in, typed events out.

use thiserror::Error;

use super::protocol::{
    decode_pcm16, frame_type, pcm16_from_bytes, AudioPayload, ErrorPayload, FrameEnvelope,
    LevelPayload, SessionReadyPayload, TextPayload,
};
use super::transport::RawFrame;
use crate::error::{ProviderError, ProviderErrorKind};

/// Typed event fed into the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TokenDelta(String),
    TurnComplete,
    ProviderError(ProviderError),
    /// Output level in `[0, 1]`.
    AudioLevel(f32),
    /// What the user said, as recognised by a realtime backend.
    UserTranscript(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Event(StreamEvent),
    /// Assistant audio for the host to play. Its level comes along with it.
    Audio { samples: Vec<i16>, level: f32 },
    SessionReady { session_id: Option<String> },
    /// Unknown frame type; forward compatible.
    Ignored,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid '{frame}' payload: {source}")]
    Payload {
        frame: String,
        source: serde_json::Error,
    },
    #[error("invalid audio payload: {0}")]
    Audio(#[from] base64::DecodeError),
}

/// Frames are decoded strictly in arrival order by a single consumer.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    decoded: u64,
    ignored: u64,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, frame: &RawFrame) -> Result<DecodedFrame, DecodeError> {
        match frame {
            RawFrame::Text(text) => self.decode_text(text),
            RawFrame::Binary(bytes) => {
                self.decoded += 1;
                Ok(audio_frame(pcm16_from_bytes(bytes)))
            }
        }
    }

    pub fn decode_text(&mut self, text: &str) -> Result<DecodedFrame, DecodeError> {
        let envelope: FrameEnvelope = serde_json::from_str(text)?;
        let payload = envelope.payload;
        let kind = envelope.kind.as_str();

        let parse_err = |source| DecodeError::Payload {
            frame: kind.to_string(),
            source,
        };

        let decoded = match kind {
            frame_type::TOKEN => {
                let text = serde_json::from_value::<TextPayload>(payload).map_err(parse_err)?;
                DecodedFrame::Event(StreamEvent::TokenDelta(text.into_text()))
            }
            frame_type::TURN_COMPLETE => DecodedFrame::Event(StreamEvent::TurnComplete),
            frame_type::ERROR => {
                let (wire_kind, message) = if payload.is_null() {
                    (None, String::new())
                } else {
                    serde_json::from_value::<ErrorPayload>(payload)
                        .map_err(parse_err)?
                        .into_parts()
                };
                let kind = wire_kind
                    .as_deref()
                    .map(ProviderErrorKind::from_wire)
                    .unwrap_or(ProviderErrorKind::ConnectionLost);
                let message = if message.is_empty() {
                    "backend reported an error".to_string()
                } else {
                    message
                };
                DecodedFrame::Event(StreamEvent::ProviderError(ProviderError::new(kind, message)))
            }
            frame_type::AUDIO_LEVEL => {
                let level = serde_json::from_value::<LevelPayload>(payload).map_err(parse_err)?;
                DecodedFrame::Event(StreamEvent::AudioLevel(clamp_level(level.level())))
            }
            frame_type::USER_TRANSCRIPT => {
                let text = serde_json::from_value::<TextPayload>(payload).map_err(parse_err)?;
                DecodedFrame::Event(StreamEvent::UserTranscript(text.into_text()))
            }
            frame_type::AUDIO => {
                let audio = serde_json::from_value::<AudioPayload>(payload).map_err(parse_err)?;
                audio_frame(decode_pcm16(audio.data())?)
            }
            frame_type::SESSION_READY => {
                let ready = if payload.is_null() {
                    SessionReadyPayload::default()
                } else {
                    serde_json::from_value::<SessionReadyPayload>(payload).map_err(parse_err)?
                };
                DecodedFrame::SessionReady {
                    session_id: ready.session_id,
                }
            }
            other => {
                log::debug!("Decoder: ignoring frame type '{}'", other);
                self.ignored += 1;
                return Ok(DecodedFrame::Ignored);
            }
        };

        self.decoded += 1;
        Ok(decoded)
    }

    /// `(decoded, ignored)` frame counts.
    pub fn counts(&self) -> (u64, u64) {
        (self.decoded, self.ignored)
    }
}

fn audio_frame(samples: Vec<i16>) -> DecodedFrame {
    let level = rms_level(&samples);
    DecodedFrame::Audio { samples, level }
}

fn clamp_level(level: f32) -> f32 {
    if level.is_finite() {
        level.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// RMS of PCM16 samples, normalised to `[0, 1]`.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    clamp_level((sum_sq / samples.len() as f64).sqrt() as f32)
}
