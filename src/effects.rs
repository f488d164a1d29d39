//! Effect runner for the session engine
//!
//! Executes the effects produced by the state machine. Completion and
//! failure come back to the engine loop as events on the provided channel.
//!
//! Provider effects go through a single sequential worker (the provider
//! slot), so a `StopProvider` queued before a `StartProvider` has fully
//! finished before the next adapter is even constructed. At most one adapter
//! is alive at any instant. The engine loop never waits on the slot; callers
//! that need teardown to be complete wait on [`EffectRunner::barrier`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::providers::{ProviderAdapter, ProviderEventSink, ProviderRegistry, SendRequest, StreamContext};
use crate::session::{Modality, ProviderId, SessionId, TurnRecord};
use crate::state_machine::{Effect, Event, Generation};
use crate::watchdog::StallWatchdog;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Resolves once every effect spawned so far has been carried out.
    fn barrier(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let _ = done.send(());
        rx
    }
}

enum SlotCommand {
    Start {
        generation: Generation,
        session_id: SessionId,
        modality: Modality,
        provider_id: ProviderId,
        history: Vec<TurnRecord>,
        cancel: CancellationToken,
        tx: mpsc::Sender<Event>,
    },
    Stop {
        generation: Generation,
    },
    Send {
        generation: Generation,
        request: SendRequest,
        tx: mpsc::Sender<Event>,
    },
    SetMuted {
        generation: Generation,
        muted: bool,
    },
    Barrier(oneshot::Sender<()>),
}

/// Runner backed by the provider registry and a stall watchdog.
pub struct EngineEffectRunner {
    slot: mpsc::UnboundedSender<SlotCommand>,
    /// Start that may still be connecting, so a stop can cut it short.
    pending_start: Mutex<Option<(Generation, CancellationToken)>>,
    watchdog: StallWatchdog,
}

impl EngineEffectRunner {
    /// Must be called from within a tokio runtime.
    pub fn new(providers: Arc<ProviderRegistry>, stall_timeout: Duration) -> Arc<Self> {
        let (slot, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_provider_slot(providers, rx));
        log::info!(
            "Effect runner started (stall window {:?})",
            stall_timeout
        );

        Arc::new(Self {
            slot,
            pending_start: Mutex::new(None),
            watchdog: StallWatchdog::new(stall_timeout),
        })
    }

    fn queue(&self, command: SlotCommand) {
        if self.slot.send(command).is_err() {
            log::error!("Provider slot is gone, dropping command");
        }
    }
}

impl EffectRunner for EngineEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartProvider {
                generation,
                session_id,
                modality,
                provider_id,
                history,
            } => {
                let cancel = CancellationToken::new();
                *self
                    .pending_start
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some((generation, cancel.clone()));
                self.queue(SlotCommand::Start {
                    generation,
                    session_id,
                    modality,
                    provider_id,
                    history,
                    cancel,
                    tx,
                });
            }
            Effect::StopProvider { generation } => {
                let mut pending = self
                    .pending_start
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if pending.as_ref().is_some_and(|(g, _)| *g == generation) {
                    if let Some((_, cancel)) = pending.take() {
                        cancel.cancel();
                    }
                }
                drop(pending);
                self.queue(SlotCommand::Stop { generation });
            }
            Effect::SendToProvider {
                generation,
                text,
                history,
            } => {
                self.queue(SlotCommand::Send {
                    generation,
                    request: SendRequest { text, history },
                    tx,
                });
            }
            Effect::SetProviderMuted { generation, muted } => {
                self.queue(SlotCommand::SetMuted { generation, muted });
            }
            Effect::ArmWatchdog { generation, seq } => {
                self.watchdog.arm(generation, seq, tx);
            }
            Effect::DisarmWatchdog => self.watchdog.disarm(),
            Effect::EmitUi => {
                log::debug!("EmitUi is handled by the engine loop");
            }
        }
    }

    fn barrier(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(SlotCommand::Barrier(done))) =
            self.slot.send(SlotCommand::Barrier(done))
        {
            // Worker already finished everything it will ever do.
            let _ = done.send(());
        }
        rx
    }
}

/// The live adapter and the generation it serves.
struct ActiveProvider {
    generation: Generation,
    adapter: Box<dyn ProviderAdapter>,
}

async fn run_provider_slot(
    providers: Arc<ProviderRegistry>,
    mut rx: mpsc::UnboundedReceiver<SlotCommand>,
) {
    let mut active: Option<ActiveProvider> = None;

    while let Some(command) = rx.recv().await {
        match command {
            SlotCommand::Start {
                generation,
                session_id,
                modality,
                provider_id,
                history,
                cancel,
                tx,
            } => {
                if let Some(mut old) = active.take() {
                    log::warn!(
                        "Provider slot: generation {} still live at start of {}, stopping it",
                        old.generation,
                        generation
                    );
                    old.adapter.stop().await;
                }
                if cancel.is_cancelled() {
                    log::debug!("Provider slot: start of generation {} cancelled before it began", generation);
                    continue;
                }

                let Some(mut adapter) = providers.create(&provider_id, modality) else {
                    let error = ProviderError::rejected(format!("unknown provider {}", provider_id));
                    let _ = tx.send(Event::ProviderFailed { generation, error }).await;
                    continue;
                };

                log::info!(
                    "Provider slot: starting {} ({}) for generation {}",
                    provider_id,
                    adapter.name(),
                    generation
                );
                let ctx = StreamContext {
                    session_id,
                    modality,
                    history,
                    events: ProviderEventSink::new(generation, tx.clone()),
                };

                let started = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = adapter.start_stream(ctx) => Some(result),
                };

                match outcome {
                    Some(Ok(())) => {
                        log::info!(
                            "Provider slot: generation {} live after {}ms",
                            generation,
                            started.elapsed().as_millis()
                        );
                        active = Some(ActiveProvider {
                            generation,
                            adapter,
                        });
                        let _ = tx.send(Event::ProviderReady { generation }).await;
                    }
                    Some(Err(error)) => {
                        log::error!(
                            "Provider slot: {} failed to start: {}",
                            provider_id,
                            error
                        );
                        adapter.stop().await;
                        let _ = tx.send(Event::ProviderFailed { generation, error }).await;
                    }
                    None => {
                        log::info!("Provider slot: start of generation {} cancelled", generation);
                        adapter.stop().await;
                    }
                }
            }

            SlotCommand::Stop { generation } => {
                if active.as_ref().is_some_and(|p| p.generation == generation) {
                    if let Some(mut provider) = active.take() {
                        provider.adapter.stop().await;
                        log::info!("Provider slot: generation {} torn down", generation);
                    }
                } else {
                    log::debug!("Provider slot: nothing live for generation {}", generation);
                }
            }

            SlotCommand::Send {
                generation,
                request,
                tx,
            } => match active.as_mut() {
                Some(provider) if provider.generation == generation => {
                    if let Err(error) = provider.adapter.send(request).await {
                        log::warn!("Provider slot: send failed: {}", error);
                        let _ = tx.send(Event::ProviderFailed { generation, error }).await;
                    }
                }
                _ => log::debug!("Provider slot: dropping send for stale generation {}", generation),
            },

            SlotCommand::SetMuted { generation, muted } => match active.as_mut() {
                Some(provider) if provider.generation == generation => {
                    if !provider.adapter.capabilities().mute {
                        log::debug!("Provider slot: {} has no mute", provider.adapter.name());
                    } else if let Err(e) = provider.adapter.set_muted(muted).await {
                        log::warn!("Provider slot: mute={} failed: {}", muted, e);
                    }
                }
                _ => log::debug!("Provider slot: dropping mute for stale generation {}", generation),
            },

            SlotCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    if let Some(mut provider) = active.take() {
        log::info!("Provider slot: closing, stopping generation {}", provider.generation);
        provider.adapter.stop().await;
    }
    log::debug!("Provider slot: ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Capabilities;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    struct Counting {
        counters: Arc<Counters>,
        delay: Duration,
        live: bool,
    }

    #[async_trait]
    impl ProviderAdapter for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn start_stream(&mut self, _ctx: StreamContext) -> Result<(), ProviderError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
            self.live = true;
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn stop(&mut self) {
            if self.live {
                self.live = false;
                self.counters.live.fetch_sub(1, Ordering::SeqCst);
                self.counters.stops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn runner(delay: Duration) -> (Arc<EngineEffectRunner>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mut providers = ProviderRegistry::new();
        let c = Arc::clone(&counters);
        providers.register("p", Modality::Text, move || {
            Box::new(Counting {
                counters: Arc::clone(&c),
                delay,
                live: false,
            })
        });
        (
            EngineEffectRunner::new(Arc::new(providers), Duration::from_secs(15)),
            counters,
        )
    }

    fn start(generation: Generation) -> Effect {
        Effect::StartProvider {
            generation,
            session_id: uuid::Uuid::new_v4(),
            modality: Modality::Text,
            provider_id: ProviderId::from("p"),
            history: vec![],
        }
    }

    #[tokio::test]
    async fn stop_then_start_never_overlaps() {
        let (runner, counters) = runner(Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(16);

        runner.spawn(start(1), tx.clone());
        runner.spawn(Effect::StopProvider { generation: 1 }, tx.clone());
        runner.spawn(start(2), tx.clone());
        runner.barrier().await.unwrap();

        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.recv().await, Some(Event::ProviderReady { generation: 1 })));
        assert!(matches!(rx.recv().await, Some(Event::ProviderReady { generation: 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_a_slow_start() {
        let (runner, counters) = runner(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(16);

        runner.spawn(start(1), tx.clone());
        tokio::task::yield_now().await;
        runner.spawn(Effect::StopProvider { generation: 1 }, tx);
        runner.barrier().await.unwrap();

        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_provider_fails_the_generation() {
        let (runner, _counters) = runner(Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(4);

        runner.spawn(
            Effect::StartProvider {
                generation: 4,
                session_id: uuid::Uuid::new_v4(),
                modality: Modality::Voice,
                provider_id: ProviderId::from("p"),
                history: vec![],
            },
            tx,
        );
        match rx.recv().await {
            Some(Event::ProviderFailed { generation: 4, error }) => {
                assert!(error.message.contains("unknown provider"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
