//! Session engine: the single-writer loop and its public async API.
//!
//! ```text
//! SessionEngine (any task) ──Command──▶ ┌─────────────┐ ──Effect──▶ EffectRunner
//!                                       │ engine loop │                 │
//!     adapters / watchdog ───Event────▶ │ admit+reduce│ ◀────Event──────┘
//!                                       └──────┬──────┘
//!                                              ▼
//!                                 watch<SessionSnapshot> ──▶ SessionObserver
//! ```
//!
//! The loop owns the [`State`] and never waits on a provider. Operations that
//! must observe completed teardown (`cancel`, `end`, `shutdown`) wait on the
//! runner's barrier outside the loop.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::consent::{ConsentGate, ConsentStatus, FileConsentStore};
use crate::credentials;
use crate::effects::{EffectRunner, EngineEffectRunner};
use crate::error::{SessionError, SessionFault};
use crate::finalizer::{Finalizer, HttpFinalizer, SessionSummary};
use crate::metrics::{MetricsCollector, MetricsSummary, SessionMetrics};
use crate::providers::{ChannelAudioInput, NullAudioOutput, ProviderRegistry};
use crate::registry::{SessionLease, SessionRegistry};
use crate::session::{Modality, ProviderId, SessionId, SessionInfo, Turn, TurnRecord};
use crate::settings::EngineSettings;
use crate::state_machine::{admit, admit_finish, reduce, EndReason, Effect, Event, Generation, Phase, State};

/// Capacity of the provider / watchdog event queue.
const EVENT_QUEUE: usize = 256;

const COMMAND_QUEUE: usize = 32;

/// Observable projection of the session, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: Phase,
    pub muted: bool,
    pub session: Option<SessionInfo>,
    pub transcript: Vec<Turn>,
    pub audio_level: f32,
    pub error: Option<SessionFault>,
}

impl SessionSnapshot {
    fn from_state(state: &State) -> Self {
        Self {
            state: state.phase,
            muted: state.is_muted(),
            session: state.session.clone(),
            transcript: state.transcript.turns().to_vec(),
            audio_level: state.audio_level,
            error: state.error.clone(),
        }
    }

    /// Text of the in-flight assistant turn, if one is streaming.
    pub fn streaming_text(&self) -> Option<&str> {
        self.transcript
            .last()
            .filter(|t| t.streaming)
            .map(|t| t.content.as_str())
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::from_state(&State::default())
    }
}

/// Read side of the engine. Reads never block the engine loop.
#[derive(Debug, Clone)]
pub struct SessionObserver {
    rx: watch::Receiver<SessionSnapshot>,
}

impl SessionObserver {
    pub fn current(&self) -> SessionSnapshot {
        self.rx.borrow().clone()
    }

    /// Next published snapshot. `None` once the engine is gone.
    pub async fn changed(&mut self) -> Option<SessionSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// First snapshot (current one included) matching `predicate`.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        self.rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start {
        modality: Modality,
        provider_id: ProviderId,
        reply: Reply<Result<(), SessionError>>,
    },
    /// send / mute / unmute / switch
    Intent {
        event: Event,
        reply: Reply<Result<(), SessionError>>,
    },
    Close {
        reason: EndReason,
        reply: Reply<()>,
    },
    Finish {
        reply: Reply<Result<(SessionId, Vec<TurnRecord>), SessionError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

pub struct SessionEngineBuilder {
    settings: EngineSettings,
    providers: Option<ProviderRegistry>,
    consent: Option<Arc<ConsentGate>>,
    finalizer: Option<Arc<dyn Finalizer>>,
    sessions: Option<Arc<SessionRegistry>>,
}

impl SessionEngineBuilder {
    fn new() -> Self {
        Self {
            settings: EngineSettings::default(),
            providers: None,
            consent: None,
            finalizer: None,
            sessions: None,
        }
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn consent(mut self, consent: Arc<ConsentGate>) -> Self {
        self.consent = Some(consent);
        self
    }

    pub fn finalizer(mut self, finalizer: Arc<dyn Finalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Defaults to the process-wide registry.
    pub fn session_registry(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Spawns the engine loop. Must be called from within a tokio runtime.
    pub fn build(self) -> SessionEngine {
        let settings = self.settings;
        let needs_token = self.providers.is_none() || self.finalizer.is_none();
        let token = if needs_token {
            credentials::auth_token()
        } else {
            None
        };
        if needs_token && token.is_none() {
            log::warn!("No backend auth token configured; requests go out unauthenticated");
        }

        let providers = Arc::new(self.providers.unwrap_or_else(|| {
            ProviderRegistry::with_defaults(
                &settings,
                token.clone(),
                Arc::new(ChannelAudioInput::new()),
                Arc::new(NullAudioOutput),
            )
        }));
        let consent = self.consent.unwrap_or_else(|| {
            Arc::new(match FileConsentStore::default_location() {
                Some(store) => ConsentGate::new(store),
                None => {
                    log::warn!("No config directory; consent is kept in memory only");
                    ConsentGate::in_memory(ConsentStatus::Unknown)
                }
            })
        });
        let finalizer = self.finalizer.unwrap_or_else(|| {
            Arc::new(HttpFinalizer::new(
                settings.finalize_url(),
                token,
                settings.finalize_timeout(),
            ))
        });
        let sessions = self.sessions.unwrap_or_else(SessionRegistry::global);

        let runner: Arc<dyn EffectRunner> =
            EngineEffectRunner::new(Arc::clone(&providers), settings.stall_timeout());
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (snapshots_tx, snapshots_rx) = watch::channel(SessionSnapshot::default());

        let engine_loop = EngineLoop {
            state: State::default(),
            runner,
            providers: Arc::clone(&providers),
            consent: Arc::clone(&consent),
            sessions,
            lease: None,
            snapshots: snapshots_tx,
            metrics: Arc::clone(&metrics),
            events_tx,
            waiters: Vec::new(),
        };
        tokio::spawn(engine_loop.run(commands_rx, events_rx));

        SessionEngine {
            commands: commands_tx,
            snapshots: snapshots_rx,
            consent,
            finalizer,
            metrics,
            providers,
        }
    }
}

/// Handle to one engine. Dropping the last handle tears the session down.
pub struct SessionEngine {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    consent: Arc<ConsentGate>,
    finalizer: Arc<dyn Finalizer>,
    metrics: Arc<Mutex<MetricsCollector>>,
    providers: Arc<ProviderRegistry>,
}

impl SessionEngine {
    pub fn builder() -> SessionEngineBuilder {
        SessionEngineBuilder::new()
    }

    /// Engine with default providers, file-backed consent and HTTP finalizer.
    pub fn new(settings: EngineSettings) -> Self {
        Self::builder().settings(settings).build()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::EngineClosed)?;
        rx.await.map_err(|_| SessionError::EngineClosed)
    }

    async fn intent(&self, event: Event) -> Result<(), SessionError> {
        self.request(|reply| Command::Intent { event, reply }).await?
    }

    /// Start a session. Resolves once the provider is live (or failed to
    /// come up, in which case the observer shows the `error` state).
    pub async fn start(
        &self,
        modality: Modality,
        provider_id: impl Into<ProviderId>,
    ) -> Result<SessionObserver, SessionError> {
        let provider_id = provider_id.into();
        self.request(|reply| Command::Start {
            modality,
            provider_id,
            reply,
        })
        .await??;
        Ok(self.observer())
    }

    /// Text sessions only. Returns once the message is handed to the provider.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.intent(Event::Send { text: text.into() }).await
    }

    pub async fn mute(&self) -> Result<(), SessionError> {
        self.intent(Event::SetMuted { muted: true }).await
    }

    pub async fn unmute(&self) -> Result<(), SessionError> {
        self.intent(Event::SetMuted { muted: false }).await
    }

    /// Resolves after the old provider is torn down and the new one is live
    /// (or failed).
    pub async fn switch_provider(&self, provider_id: impl Into<ProviderId>) -> Result<(), SessionError> {
        self.intent(Event::SwitchProvider {
            provider_id: provider_id.into(),
        })
        .await
    }

    /// Abort from any state. Idempotent. Resolves after teardown.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Close {
            reason: EndReason::Cancelled,
            reply,
        })
        .await
    }

    /// Close normally. Idempotent. Resolves after teardown.
    pub async fn end(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Close {
            reason: EndReason::Ended,
            reply,
        })
        .await
    }

    /// Summarize the transcript so far. The live session is left as it is,
    /// whether this succeeds or not.
    pub async fn finish(&self) -> Result<SessionSummary, SessionError> {
        let (session_id, turns) = self.request(|reply| Command::Finish { reply }).await??;

        match self.finalizer.finalize(session_id, &turns).await {
            Ok(key_points) => Ok(SessionSummary {
                session_id,
                key_points,
                turn_count: turns.len(),
                created_at: Utc::now(),
            }),
            Err(e) => {
                log::warn!("Finalize failed for session {} (session continues): {}", session_id, e);
                self.metrics.lock().await.record_error(
                    "finalize".to_string(),
                    e.to_string(),
                    Some(session_id.to_string()),
                );
                Err(e.into())
            }
        }
    }

    pub fn observer(&self) -> SessionObserver {
        SessionObserver {
            rx: self.snapshots.clone(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn consent(&self) -> &ConsentGate {
        &self.consent
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.ids()
    }

    pub async fn metrics(&self) -> MetricsSummary {
        self.metrics.lock().await.get_summary()
    }

    pub async fn metrics_history(&self) -> Vec<SessionMetrics> {
        self.metrics.lock().await.get_history()
    }

    /// Tear down any live session and stop the loop. Later calls fail with
    /// `EngineClosed`.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            log::debug!("Engine already shut down");
        }
    }
}

/// What a reducer step means for metrics, captured before the event is consumed.
enum MetricsHint {
    Started(SessionId, Modality, ProviderId),
    Switched(ProviderId),
    Closed(EndReason),
}

impl MetricsHint {
    fn of(event: &Event) -> Option<Self> {
        match event {
            Event::Start { session } => Some(MetricsHint::Started(
                session.id,
                session.modality,
                session.provider_id.clone(),
            )),
            Event::SwitchProvider { provider_id } => Some(MetricsHint::Switched(provider_id.clone())),
            Event::Stop { reason } => Some(MetricsHint::Closed(*reason)),
            _ => None,
        }
    }
}

struct EngineLoop {
    state: State,
    runner: Arc<dyn EffectRunner>,
    providers: Arc<ProviderRegistry>,
    consent: Arc<ConsentGate>,
    sessions: Arc<SessionRegistry>,
    lease: Option<SessionLease>,
    snapshots: watch::Sender<SessionSnapshot>,
    metrics: Arc<Mutex<MetricsCollector>>,
    events_tx: mpsc::Sender<Event>,
    /// start / switch callers waiting for their generation to leave `initializing`
    waiters: Vec<(Generation, Reply<Result<(), SessionError>>)>,
}

impl EngineLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::Receiver<Event>) {
        self.publish();
        log::info!("Session engine loop started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        log::info!("Shutdown requested");
                        self.close(&mut events).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        log::info!("All engine handles dropped");
                        self.close(&mut events).await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.dispatch(event).await,
            }
        }

        log::info!("Session engine loop ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                modality,
                provider_id,
                reply,
            } => match self.start_session(modality, provider_id).await {
                Ok(()) => self.reply_when_ready(reply),
                Err(e) => {
                    log::warn!("start({}) rejected: {}", modality, e);
                    let _ = reply.send(Err(e));
                }
            },

            Command::Intent { event, reply } => {
                if let Err(e) = self.check_intent(&event) {
                    log::debug!("Intent rejected in {}: {}", self.state.phase, e);
                    let _ = reply.send(Err(e));
                    return;
                }
                let is_switch = matches!(event, Event::SwitchProvider { .. });
                self.dispatch(event).await;
                if is_switch {
                    self.reply_when_ready(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }

            Command::Close { reason, reply } => {
                self.dispatch(Event::Stop { reason }).await;
                // The slot stays owned until the provider has actually stopped.
                let lease = self.lease.take();
                let barrier = self.runner.barrier();
                tokio::spawn(async move {
                    let _ = barrier.await;
                    if let Some(lease) = lease {
                        release_lease(lease);
                    }
                    let _ = reply.send(());
                });
            }

            Command::Finish { reply } => {
                let _ = reply.send(admit_finish(&self.state));
            }

            Command::Shutdown { reply } => {
                // Handled by the loop itself.
                let _ = reply.send(());
            }
        }
    }

    async fn start_session(&mut self, modality: Modality, provider_id: ProviderId) -> Result<(), SessionError> {
        let status = self.consent.require_consent(modality);
        let session = SessionInfo::new(modality, provider_id.clone(), status);
        let session_id = session.id;
        let event = Event::Start { session };

        admit(&self.state, &event)?;
        if !self.providers.supports(&provider_id, modality) {
            return Err(SessionError::UnknownProvider {
                provider_id,
                modality,
            });
        }
        if !status.is_granted() {
            return Err(SessionError::ConsentRequired { modality, status });
        }
        self.acquire_lease(modality, session_id)?;

        log::info!(
            "Starting {} session {} with provider {}",
            modality,
            session_id,
            provider_id
        );
        self.dispatch(event).await;
        Ok(())
    }

    /// A restart from `error` in the same modality keeps the slot.
    fn acquire_lease(&mut self, modality: Modality, session_id: SessionId) -> Result<(), SessionError> {
        if let Some(lease) = self.lease.as_mut().filter(|l| l.modality() == modality) {
            lease.transfer(session_id);
            return Ok(());
        }
        let lease = self.sessions.try_acquire(modality, session_id)?;
        if let Some(old) = self.lease.replace(lease) {
            // The failed session's provider may still be stopping.
            let barrier = self.runner.barrier();
            tokio::spawn(async move {
                let _ = barrier.await;
                release_lease(old);
            });
        }
        Ok(())
    }

    fn check_intent(&self, event: &Event) -> Result<(), SessionError> {
        admit(&self.state, event)?;
        if let Event::SwitchProvider { provider_id } = event {
            let modality = self.state.modality().ok_or(SessionError::Busy {
                phase: self.state.phase,
            })?;
            if !self.providers.supports(provider_id, modality) {
                return Err(SessionError::UnknownProvider {
                    provider_id: provider_id.clone(),
                    modality,
                });
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, event: Event) {
        log::debug!("Received event: {:?}", event);

        let hint = MetricsHint::of(&event);
        let prev_phase = self.state.phase;
        let prev_generation = self.state.generation;

        let (next, effects) = reduce(std::mem::take(&mut self.state), event);
        self.state = next;

        if prev_phase != self.state.phase {
            log::info!("State transition: {:?} -> {:?}", prev_phase, self.state.phase);
        }
        self.track_metrics(hint, prev_phase, prev_generation).await;

        for effect in effects {
            match effect {
                Effect::EmitUi => self.publish(),
                other => self.runner.spawn(other, self.events_tx.clone()),
            }
        }

        self.resolve_waiters();
    }

    async fn track_metrics(&self, hint: Option<MetricsHint>, prev_phase: Phase, prev_generation: Generation) {
        let phase = self.state.phase;
        let new_generation = self.state.generation != prev_generation;
        let mut metrics = self.metrics.lock().await;

        match hint {
            Some(MetricsHint::Started(id, modality, provider_id)) if new_generation => {
                metrics.session_started(id, modality, provider_id)
            }
            Some(MetricsHint::Switched(provider_id)) if new_generation => {
                metrics.provider_switched(provider_id)
            }
            Some(MetricsHint::Closed(reason)) if prev_phase != Phase::Idle && phase == Phase::Idle => {
                metrics.session_closed(reason)
            }
            _ => {}
        }

        match (prev_phase, phase) {
            (Phase::Processing, Phase::Processing) => {}
            (_, Phase::Processing) => metrics.request_sent(),
            (Phase::Processing, Phase::Speaking) => metrics.first_token(),
            (Phase::Processing | Phase::Speaking, Phase::Listening) => metrics.turn_completed(),
            (Phase::Error, Phase::Error) => {}
            (_, Phase::Error) => {
                if let Some(fault) = &self.state.error {
                    metrics.session_failed(fault.kind.as_str(), fault.detail.clone());
                }
            }
            _ => {}
        }
    }

    fn reply_when_ready(&mut self, reply: Reply<Result<(), SessionError>>) {
        if self.state.phase == Phase::Initializing {
            self.waiters.push((self.state.generation, reply));
        } else {
            let _ = reply.send(Ok(()));
        }
    }

    fn resolve_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let generation = self.state.generation;
        let initializing = self.state.phase == Phase::Initializing;

        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(g, _)| *g != generation || !initializing);
        self.waiters = pending;
        for (_, reply) in ready {
            let _ = reply.send(Ok(()));
        }
    }

    fn publish(&self) {
        self.snapshots
            .send_replace(SessionSnapshot::from_state(&self.state));
    }

    /// Final teardown: stop the session and wait until the provider is gone.
    async fn close(&mut self, events: &mut mpsc::Receiver<Event>) {
        self.dispatch(Event::Stop {
            reason: EndReason::Cancelled,
        })
        .await;
        // Nothing produced from here on can matter.
        events.close();
        let _ = self.runner.barrier().await;
        if let Some(lease) = self.lease.take() {
            release_lease(lease);
        }
    }
}

fn release_lease(lease: SessionLease) {
    log::debug!("Released {} slot of session {}", lease.modality(), lease.session_id());
    drop(lease);
}
