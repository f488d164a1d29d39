//! Scripted providers and helpers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use session_engine::error::FinalizeError;
use session_engine::providers::{
    Capabilities, ProviderAdapter, ProviderEventSink, ProviderRegistry, SendRequest, StreamContext,
};
use session_engine::{
    ConsentGate, ConsentStatus, Finalizer, Modality, ProviderError, SessionEngine, SessionId,
    SessionRegistry, TurnRecord,
};

/// How a scripted adapter behaves.
#[derive(Clone, Default)]
pub struct Script {
    pub start_delay: Duration,
    /// How long `stop` takes before the handle is gone.
    pub stop_delay: Duration,
    pub fail_start: Option<ProviderError>,
    /// Deltas streamed back (then `turn_complete`) for every `send`.
    pub reply: Option<Vec<String>>,
}

impl Script {
    pub fn replying(deltas: &[&str]) -> Self {
        Self {
            reply: Some(deltas.iter().map(|d| d.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn slow_stop(delay: Duration) -> Self {
        Self {
            stop_delay: delay,
            ..Self::default()
        }
    }
}

/// Observes every scripted adapter built from one registry.
#[derive(Default)]
pub struct Probe {
    starts: AtomicUsize,
    stops: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    log: Mutex<Vec<String>>,
    sends: Mutex<Vec<SendRequest>>,
    mutes: Mutex<Vec<bool>>,
    sinks: Mutex<Vec<ProviderEventSink>>,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry with one scripted adapter per `(id, modality, script)`.
    pub fn registry(self: &Arc<Self>, scripts: &[(&str, Modality, Script)]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for (id, modality, script) in scripts {
            let probe = Arc::clone(self);
            let id_owned = id.to_string();
            let modality = *modality;
            let script = script.clone();
            registry.register(*id, modality, move || {
                Box::new(ScriptedAdapter {
                    id: id_owned.clone(),
                    modality,
                    script: script.clone(),
                    probe: Arc::clone(&probe),
                    live: false,
                    sink: None,
                })
            });
        }
        registry
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// `start:<id>` / `stop:<id>` in the order they happened.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<SendRequest> {
        self.sends.lock().unwrap().clone()
    }

    pub fn mutes(&self) -> Vec<bool> {
        self.mutes.lock().unwrap().clone()
    }

    /// Sink of the most recently started adapter.
    pub fn sink(&self) -> ProviderEventSink {
        self.sinks
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no adapter has started yet")
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

struct ScriptedAdapter {
    id: String,
    modality: Modality,
    script: Script,
    probe: Arc<Probe>,
    live: bool,
    sink: Option<ProviderEventSink>,
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            send: self.modality == Modality::Text,
            mute: self.modality == Modality::Voice,
        }
    }

    async fn start_stream(&mut self, ctx: StreamContext) -> Result<(), ProviderError> {
        self.probe.record(format!("start:{}", self.id));
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        let live = self.probe.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_live.fetch_max(live, Ordering::SeqCst);
        self.live = true;

        if !self.script.start_delay.is_zero() {
            tokio::time::sleep(self.script.start_delay).await;
        }
        if let Some(error) = self.script.fail_start.clone() {
            return Err(error);
        }

        self.probe.sinks.lock().unwrap().push(ctx.events.clone());
        self.sink = Some(ctx.events);
        Ok(())
    }

    async fn send(&mut self, request: SendRequest) -> Result<(), ProviderError> {
        self.probe.sends.lock().unwrap().push(request);
        if let (Some(deltas), Some(sink)) = (self.script.reply.clone(), self.sink.clone()) {
            tokio::spawn(async move {
                for delta in deltas {
                    sink.token(delta).await;
                }
                sink.turn_complete().await;
            });
        }
        Ok(())
    }

    async fn set_muted(&mut self, muted: bool) -> Result<(), ProviderError> {
        self.probe.mutes.lock().unwrap().push(muted);
        Ok(())
    }

    async fn stop(&mut self) {
        if self.live {
            if !self.script.stop_delay.is_zero() {
                tokio::time::sleep(self.script.stop_delay).await;
            }
            self.live = false;
            self.probe.live.fetch_sub(1, Ordering::SeqCst);
            self.probe.stops.fetch_add(1, Ordering::SeqCst);
            self.probe.record(format!("stop:{}", self.id));
        }
    }
}

/// Finalizer returning canned key points (or a canned failure).
pub struct StaticFinalizer {
    result: Result<Vec<String>, FinalizeError>,
    calls: AtomicUsize,
    last_turns: Mutex<Vec<TurnRecord>>,
}

impl StaticFinalizer {
    pub fn points(points: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(points.iter().map(|p| p.to_string()).collect()),
            calls: AtomicUsize::new(0),
            last_turns: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: FinalizeError) -> Arc<Self> {
        Arc::new(Self {
            result: Err(error),
            calls: AtomicUsize::new(0),
            last_turns: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_turns(&self) -> Vec<TurnRecord> {
        self.last_turns.lock().unwrap().clone()
    }
}

#[async_trait]
impl Finalizer for StaticFinalizer {
    async fn finalize(
        &self,
        _session_id: SessionId,
        turns: &[TurnRecord],
    ) -> Result<Vec<String>, FinalizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_turns.lock().unwrap() = turns.to_vec();
        self.result.clone()
    }
}

/// Engine over `providers` with granted consent, a private session registry
/// and a canned finalizer.
pub fn engine(providers: ProviderRegistry) -> SessionEngine {
    engine_with(
        providers,
        ConsentStatus::Granted,
        StaticFinalizer::points(&["noted"]),
        Arc::new(SessionRegistry::new()),
    )
}

pub fn engine_with(
    providers: ProviderRegistry,
    consent: ConsentStatus,
    finalizer: Arc<dyn Finalizer>,
    sessions: Arc<SessionRegistry>,
) -> SessionEngine {
    SessionEngine::builder()
        .providers(providers)
        .consent(Arc::new(ConsentGate::in_memory(consent)))
        .finalizer(finalizer)
        .session_registry(sessions)
        .build()
}

/// Poll `condition` until it holds, failing the test after `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Bound a future so a broken invariant fails instead of hanging.
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future)
        .await
        .expect("operation timed out")
}
