//! Session state machine.
//!
//! Single-writer pattern: the engine loop owns the [`State`] and every change
//! goes through [`reduce`], which returns the next state plus the effects to
//! execute. Intents from the UI are checked with [`admit`] first so invalid
//! operations can be reported to the caller instead of silently dropped.
//!
//! Provider events carry the generation of the handle that produced them.
//! Anything tagged with a generation other than the live one is stale and
//! dropped, which is what makes `cancel()` effective even when a provider
//! cannot be interrupted.

use serde::Serialize;
use std::fmt;

use crate::error::{ProviderError, SessionError, SessionFault};
use crate::session::{Modality, ProviderId, SessionId, SessionInfo, Transcript, TurnRecord};
use crate::streaming::StreamEvent;

/// Identifies one provider handle. Strictly increasing for the lifetime of an engine.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Initializing,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Initializing => "initializing",
            Phase::Listening => "listening",
            Phase::Processing => "processing",
            Phase::Speaking => "speaking",
            Phase::Error => "error",
        }
    }

    /// A provider reply is pending; the stall watchdog runs in these phases.
    pub fn awaiting_reply(&self) -> bool {
        matches!(self, Phase::Processing | Phase::Speaking)
    }

    /// A provider handle is (or is being) held.
    pub fn holds_provider(&self) -> bool {
        matches!(
            self,
            Phase::Initializing | Phase::Listening | Phase::Processing | Phase::Speaking
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session was closed by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Normal close.
    Ended,
    /// Abort.
    Cancelled,
}

/// Authoritative session state. Only the reducer produces new values.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub phase: Phase,
    pub session: Option<SessionInfo>,
    pub transcript: Transcript,
    /// Generation of the current provider handle.
    pub generation: Generation,
    /// Bumped on every arm; a stall report must quote the latest value.
    pub watchdog_seq: u64,
    pub watchdog_armed: bool,
    pub audio_level: f32,
    pub error: Option<SessionFault>,
}

impl State {
    pub fn modality(&self) -> Option<Modality> {
        self.session.as_ref().map(|s| s.modality)
    }

    pub fn provider_id(&self) -> Option<&ProviderId> {
        self.session.as_ref().map(|s| &s.provider_id)
    }

    pub fn is_muted(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.muted)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    // UI intents (validated by `admit` before reaching the reducer)
    Start {
        session: SessionInfo,
    },
    Send {
        text: String,
    },
    SetMuted {
        muted: bool,
    },
    SwitchProvider {
        provider_id: ProviderId,
    },
    Stop {
        reason: EndReason,
    },

    // Provider slot
    ProviderReady {
        generation: Generation,
    },
    ProviderFailed {
        generation: Generation,
        error: ProviderError,
    },

    /// Decoded stream data from the provider holding `generation`.
    Stream {
        generation: Generation,
        event: StreamEvent,
    },

    // Watchdog
    StallDetected {
        generation: Generation,
        seq: u64,
    },
}

#[derive(Debug, Clone)]
pub enum Effect {
    /// Create a provider handle. Runs only after every earlier `StopProvider` completed.
    StartProvider {
        generation: Generation,
        session_id: SessionId,
        modality: Modality,
        provider_id: ProviderId,
        /// Frozen turns the new provider should know about.
        history: Vec<TurnRecord>,
    },
    StopProvider {
        generation: Generation,
    },
    SendToProvider {
        generation: Generation,
        text: String,
        /// Turns preceding `text`.
        history: Vec<TurnRecord>,
    },
    SetProviderMuted {
        generation: Generation,
        muted: bool,
    },
    ArmWatchdog {
        generation: Generation,
        seq: u64,
    },
    DisarmWatchdog,
    /// Publish a fresh snapshot to observers.
    EmitUi,
}

/// Check whether a UI intent is valid in `state`.
///
/// Internal events (provider, watchdog) are always admitted; staleness is
/// handled by the reducer.
pub fn admit(state: &State, event: &Event) -> Result<(), SessionError> {
    let busy = || SessionError::Busy { phase: state.phase };

    match event {
        Event::Start { session } => match state.phase {
            Phase::Idle | Phase::Error => Ok(()),
            _ => Err(SessionError::AlreadyActive {
                modality: state.modality().unwrap_or(session.modality),
            }),
        },
        Event::Send { text } => {
            let modality = state.modality().ok_or_else(busy)?;
            if modality != Modality::Text {
                return Err(SessionError::NotSupported {
                    operation: "send",
                    modality,
                });
            }
            if text.trim().is_empty() {
                return Err(SessionError::EmptyMessage);
            }
            if state.phase != Phase::Listening {
                return Err(busy());
            }
            Ok(())
        }
        Event::SetMuted { muted } => {
            let modality = state.modality().ok_or_else(busy)?;
            if modality != Modality::Voice {
                return Err(SessionError::NotSupported {
                    operation: if *muted { "mute" } else { "unmute" },
                    modality,
                });
            }
            if state.phase != Phase::Listening {
                return Err(busy());
            }
            Ok(())
        }
        Event::SwitchProvider { .. } => match state.phase {
            Phase::Idle | Phase::Initializing => Err(busy()),
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Validate `finish()` and return what the finalizer needs.
///
/// Finishing never changes the state.
pub fn admit_finish(state: &State) -> Result<(SessionId, Vec<TurnRecord>), SessionError> {
    let session = match (&state.session, state.phase) {
        (Some(session), Phase::Listening) => session,
        _ => return Err(SessionError::Busy { phase: state.phase }),
    };
    let records = state.transcript.records();
    if records.is_empty() {
        return Err(SessionError::EmptyTranscript);
    }
    Ok((session.id, records))
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Events from a stale generation are dropped
/// - Every path into `Idle` or `Error` stops the live provider
/// - The watchdog is armed exactly while a reply is pending
/// - Always emit EmitUi after state changes
pub fn reduce(mut state: State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;

    let mut effects = Vec::new();

    match event {
        Event::Start { session } => {
            if !matches!(state.phase, Phase::Idle | Phase::Error) {
                return (state, effects);
            }
            state.generation += 1;
            disarm(&mut state, &mut effects);
            effects.push(StartProvider {
                generation: state.generation,
                session_id: session.id,
                modality: session.modality,
                provider_id: session.provider_id.clone(),
                history: Vec::new(),
            });
            state.session = Some(session);
            state.transcript = Transcript::new();
            state.error = None;
            state.audio_level = 0.0;
            state.phase = Phase::Initializing;
        }

        Event::Send { text } => {
            if state.phase != Phase::Listening {
                return (state, effects);
            }
            let history = state.transcript.records();
            state.transcript.push_user(text.clone());
            state.phase = Phase::Processing;
            effects.push(SendToProvider {
                generation: state.generation,
                text,
                history,
            });
            sync_watchdog(&mut state, &mut effects);
        }

        Event::SetMuted { muted } => {
            let Some(session) = state.session.as_mut() else {
                return (state, effects);
            };
            if state.phase != Phase::Listening || session.muted == muted {
                return (state, effects);
            }
            session.muted = muted;
            effects.push(SetProviderMuted {
                generation: state.generation,
                muted,
            });
        }

        Event::SwitchProvider { provider_id } => {
            if matches!(state.phase, Phase::Idle | Phase::Initializing) {
                return (state, effects);
            }
            let Some(session) = state.session.as_mut() else {
                return (state, effects);
            };
            if state.phase == Phase::Listening && session.provider_id == provider_id {
                log::debug!("Switch to current provider {} ignored", provider_id);
                return (state, effects);
            }

            let old_generation = state.generation;
            let had_provider = state.phase.holds_provider();
            session.provider_id = provider_id.clone();
            let session_id = session.id;
            let modality = session.modality;

            // A partial reply stays in the transcript as-is.
            state.transcript.freeze_streaming();
            disarm(&mut state, &mut effects);
            if had_provider {
                effects.push(StopProvider {
                    generation: old_generation,
                });
            }
            state.generation += 1;
            effects.push(StartProvider {
                generation: state.generation,
                session_id,
                modality,
                provider_id,
                history: state.transcript.records(),
            });
            state.error = None;
            state.audio_level = 0.0;
            state.phase = Phase::Initializing;
        }

        Event::Stop { reason } => {
            if state.phase == Phase::Idle {
                return (state, effects);
            }
            log::debug!("Session closing ({:?}) from {}", reason, state.phase);
            disarm(&mut state, &mut effects);
            if state.phase.holds_provider() {
                effects.push(StopProvider {
                    generation: state.generation,
                });
            }
            // The session is gone; its transcript goes with it.
            state.transcript = Transcript::new();
            state.session = None;
            state.error = None;
            state.audio_level = 0.0;
            state.phase = Phase::Idle;
        }

        Event::ProviderReady { generation } => {
            if generation != state.generation || state.phase != Phase::Initializing {
                log::debug!("Ignoring ProviderReady for generation {}", generation);
                return (state, effects);
            }
            mark_ready(&mut state, &mut effects);
        }

        Event::ProviderFailed { generation, error } => {
            if generation != state.generation || !state.phase.holds_provider() {
                log::debug!(
                    "Ignoring failure from stale provider generation {}: {}",
                    generation,
                    error
                );
                return (state, effects);
            }
            log::warn!("Provider failed in {}: {}", state.phase, error);
            enter_error(&mut state, &error, &mut effects);
        }

        Event::Stream { generation, event } => {
            if generation != state.generation || !state.phase.holds_provider() {
                log::debug!(
                    "Dropping stream event from generation {} (current {}, {})",
                    generation,
                    state.generation,
                    state.phase
                );
                return (state, effects);
            }
            // Data from the current handle proves it is live.
            if state.phase == Phase::Initializing {
                mark_ready(&mut state, &mut effects);
            }
            if !apply_stream_event(&mut state, event, &mut effects) {
                return (state, effects);
            }
        }

        Event::StallDetected { generation, seq } => {
            if generation != state.generation
                || seq != state.watchdog_seq
                || !state.watchdog_armed
                || !state.phase.awaiting_reply()
            {
                log::debug!("Ignoring stale stall report (generation {}, seq {})", generation, seq);
                return (state, effects);
            }
            log::warn!(
                "Stream stalled in {} (generation {}), forcing recovery",
                state.phase,
                generation
            );
            state.watchdog_armed = false;
            enter_error(
                &mut state,
                &ProviderError::stalled("no stream data within the stall window"),
                &mut effects,
            );
        }
    }

    effects.push(EmitUi);
    (state, effects)
}

/// Returns `false` when the event was dropped without changing anything.
fn apply_stream_event(state: &mut State, event: StreamEvent, effects: &mut Vec<Effect>) -> bool {
    let voice = state.modality() == Some(Modality::Voice);

    match event {
        StreamEvent::TokenDelta(delta) => {
            let accepted = state.phase.awaiting_reply() || (voice && state.phase == Phase::Listening);
            if !accepted {
                log::debug!("Dropping token delta while {}", state.phase);
                return false;
            }
            state.phase = Phase::Speaking;
            if !delta.is_empty() {
                state.transcript.append_assistant_delta(&delta);
            }
        }
        StreamEvent::TurnComplete => {
            if state.transcript.freeze_streaming().is_none() && !state.phase.awaiting_reply() {
                return false;
            }
            state.phase = Phase::Listening;
        }
        StreamEvent::ProviderError(error) => {
            log::warn!("Provider reported error in {}: {}", state.phase, error);
            enter_error(state, &error, effects);
            return true;
        }
        StreamEvent::AudioLevel(level) => {
            state.audio_level = if level.is_finite() {
                level.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
        StreamEvent::UserTranscript(text) => {
            if !voice {
                log::debug!("Dropping user transcript for a text session");
                return false;
            }
            if !text.trim().is_empty() {
                // Barge-in: the user talked over the reply.
                state.transcript.freeze_streaming();
                state.transcript.push_user(text.trim());
                state.phase = Phase::Processing;
            }
        }
    }

    sync_watchdog(state, effects);
    true
}

fn mark_ready(state: &mut State, effects: &mut Vec<Effect>) {
    state.phase = Phase::Listening;
    if state.is_muted() {
        effects.push(Effect::SetProviderMuted {
            generation: state.generation,
            muted: true,
        });
    }
}

fn enter_error(state: &mut State, error: &ProviderError, effects: &mut Vec<Effect>) {
    disarm(state, effects);
    if state.phase.holds_provider() {
        effects.push(Effect::StopProvider {
            generation: state.generation,
        });
    }
    state.transcript.discard_streaming();
    state.error = Some(SessionFault::from_provider(error));
    state.audio_level = 0.0;
    state.phase = Phase::Error;
}

/// Arm (or re-arm) while a reply is pending, otherwise make sure it is off.
fn sync_watchdog(state: &mut State, effects: &mut Vec<Effect>) {
    if state.phase.awaiting_reply() {
        state.watchdog_seq += 1;
        state.watchdog_armed = true;
        effects.push(Effect::ArmWatchdog {
            generation: state.generation,
            seq: state.watchdog_seq,
        });
    } else {
        disarm(state, effects);
    }
}

fn disarm(state: &mut State, effects: &mut Vec<Effect>) {
    if state.watchdog_armed {
        state.watchdog_armed = false;
        effects.push(Effect::DisarmWatchdog);
    }
}
