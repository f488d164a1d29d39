//! Provider adapters: one uniform contract over heterogeneous backends.
//!
//! The state machine never knows which backend it is talking to. It asks the
//! effect runner to start, feed, mute or stop "the provider of generation N",
//! and the runner looks the adapter up in the [`ProviderRegistry`] dispatch
//! table. Exactly one adapter instance exists per live generation.
//!
//! Adapter contract:
//! - `start_stream` does all setup (connection, handshake, capture). When it
//!   returns `Ok` the handle is live and may push events into its sink.
//! - `stop` reverses everything `start_stream` did, including a partial setup
//!   after a failed or cancelled start, and is idempotent.
//! - `send` returns once the request is on its way; replies flow through the sink.

pub mod audio;
pub mod text;
pub mod voice;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::session::{Modality, ProviderId, SessionId, TurnRecord};
use crate::settings::EngineSettings;
use crate::state_machine::{Event, Generation};
use crate::streaming::{RetryPolicy, StreamEvent};

pub use audio::{
    AudioCapture, AudioChunker, AudioError, AudioInput, AudioOutput, BufferedAudioOutput,
    ChannelAudioInput, Decimator, NullAudioOutput,
};
pub use text::{TextCompletionAdapter, TextConfig};
pub use voice::{RealtimeVoiceAdapter, VoiceConfig};

pub const TEXT_DEFAULT: &str = "text-default";
pub const VOICE_A: &str = "voice-a";
pub const VOICE_B: &str = "voice-b";

/// Optional operations an adapter supports beyond start / stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub send: bool,
    pub mute: bool,
}

/// Everything an adapter needs to open a stream.
pub struct StreamContext {
    pub session_id: SessionId,
    pub modality: Modality,
    /// Frozen turns so far (non-empty after a provider switch).
    pub history: Vec<TurnRecord>,
    pub events: ProviderEventSink,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub text: String,
    /// Turns preceding `text`.
    pub history: Vec<TurnRecord>,
}

#[async_trait]
pub trait ProviderAdapter: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn start_stream(&mut self, ctx: StreamContext) -> Result<(), ProviderError>;

    async fn send(&mut self, _request: SendRequest) -> Result<(), ProviderError> {
        Err(ProviderError::rejected(format!(
            "{} does not accept text input",
            self.name()
        )))
    }

    /// Pause or resume capture without tearing the handle down.
    async fn set_muted(&mut self, _muted: bool) -> Result<(), ProviderError> {
        Err(ProviderError::rejected(format!(
            "{} does not support mute",
            self.name()
        )))
    }

    async fn stop(&mut self);
}

/// Where an adapter pushes its decoded events. Tags every event with the
/// generation of the handle it belongs to.
#[derive(Debug, Clone)]
pub struct ProviderEventSink {
    generation: Generation,
    tx: mpsc::Sender<Event>,
}

impl ProviderEventSink {
    pub fn new(generation: Generation, tx: mpsc::Sender<Event>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns `false` once the engine is gone.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        self.tx
            .send(Event::Stream {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }

    pub async fn token(&self, delta: impl Into<String>) -> bool {
        self.emit(StreamEvent::TokenDelta(delta.into())).await
    }

    pub async fn turn_complete(&self) -> bool {
        self.emit(StreamEvent::TurnComplete).await
    }

    pub async fn error(&self, error: ProviderError) -> bool {
        self.emit(StreamEvent::ProviderError(error)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type AdapterFactory = Arc<dyn Fn() -> Box<dyn ProviderAdapter> + Send + Sync>;

struct RegisteredProvider {
    modality: Modality,
    factory: AdapterFactory,
}

/// Dispatch table keyed by provider id. Adapters are built on demand, one per
/// `start()` / `switch_provider()`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<ProviderId>, modality: Modality, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn ProviderAdapter> + Send + Sync + 'static,
    {
        let id = id.into();
        log::debug!("Providers: registered {} ({})", id, modality);
        self.providers.insert(
            id,
            RegisteredProvider {
                modality,
                factory: Arc::new(factory),
            },
        );
        self
    }

    pub fn modality_of(&self, id: &ProviderId) -> Option<Modality> {
        self.providers.get(id).map(|p| p.modality)
    }

    pub fn supports(&self, id: &ProviderId, modality: Modality) -> bool {
        self.modality_of(id) == Some(modality)
    }

    /// Build a fresh adapter for `id`, if it serves `modality`.
    pub fn create(&self, id: &ProviderId, modality: Modality) -> Option<Box<dyn ProviderAdapter>> {
        self.providers
            .get(id)
            .filter(|p| p.modality == modality)
            .map(|p| (p.factory)())
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.providers.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// The stock providers: `text-default`, `voice-a`, `voice-b`.
    pub fn with_defaults(
        settings: &EngineSettings,
        token: Option<String>,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let mut registry = Self::new();

        let text = TextConfig {
            url: settings.chat_url(),
            model: settings.text_model.clone(),
            token: token.clone(),
        };
        registry.register(TEXT_DEFAULT, Modality::Text, move || {
            Box::new(TextCompletionAdapter::new(text.clone()))
        });

        for (id, model) in [
            (VOICE_A, settings.voice_model_a.clone()),
            (VOICE_B, settings.voice_model_b.clone()),
        ] {
            let config = VoiceConfig {
                url: settings.realtime_url(),
                model,
                voice: settings.voice.clone(),
                token: token.clone(),
                input_sample_rate: settings.input_sample_rate,
                retry: RetryPolicy::default(),
            };
            let input = input.clone();
            let output = output.clone();
            registry.register(id, Modality::Voice, move || {
                Box::new(RealtimeVoiceAdapter::new(
                    config.clone(),
                    input.clone(),
                    output.clone(),
                ))
            });
        }

        registry
    }
}
