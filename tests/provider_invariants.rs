//! Property tests for the provider lifecycle.
//!
//! Two layers are checked against random operation sequences:
//! - the pure reducer, with effects executed by a sequential model
//! - the running engine, with operations fired concurrently at scripted
//!   adapters that start with random delays
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test provider_invariants
//! PROPTEST_CASES=256 cargo test --test provider_invariants
//! ```

mod common;

use proptest::prelude::*;
use std::time::Duration;

use common::{within, Probe, Script};
use session_engine::state_machine::{admit, reduce, EndReason, Effect, Event, Generation, Phase, State};
use session_engine::streaming::StreamEvent;
use session_engine::{ConsentStatus, Modality, ProviderError, ProviderId, SessionInfo};

// ============================================================================
// Reducer model
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Start(Modality, u8),
    Send,
    Mute(bool),
    Switch(u8),
    Stop(bool),
    Ready { stale: bool },
    Failed { stale: bool },
    Token { stale: bool },
    Complete,
    Transcript,
    Level(f32),
    StreamError,
    Stall { stale_seq: bool },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (prop_oneof![Just(Modality::Text), Just(Modality::Voice)], 0u8..3)
            .prop_map(|(m, p)| Step::Start(m, p)),
        Just(Step::Send),
        any::<bool>().prop_map(Step::Mute),
        (0u8..3).prop_map(Step::Switch),
        any::<bool>().prop_map(Step::Stop),
        any::<bool>().prop_map(|stale| Step::Ready { stale }),
        any::<bool>().prop_map(|stale| Step::Failed { stale }),
        any::<bool>().prop_map(|stale| Step::Token { stale }),
        Just(Step::Complete),
        Just(Step::Transcript),
        (-1.0f32..2.0).prop_map(Step::Level),
        Just(Step::StreamError),
        any::<bool>().prop_map(|stale_seq| Step::Stall { stale_seq }),
    ]
}

fn to_event(state: &State, step: Step) -> Event {
    let current = state.generation;
    let gen = |stale: bool| -> Generation {
        if stale {
            current.saturating_sub(1)
        } else {
            current
        }
    };
    let stream = |stale: bool, event: StreamEvent| Event::Stream {
        generation: gen(stale),
        event,
    };

    match step {
        Step::Start(modality, p) => Event::Start {
            session: SessionInfo::new(
                modality,
                ProviderId::new(format!("p{}", p)),
                ConsentStatus::Granted,
            ),
        },
        Step::Send => Event::Send {
            text: "hello".into(),
        },
        Step::Mute(muted) => Event::SetMuted { muted },
        Step::Switch(p) => Event::SwitchProvider {
            provider_id: ProviderId::new(format!("p{}", p)),
        },
        Step::Stop(cancel) => Event::Stop {
            reason: if cancel {
                EndReason::Cancelled
            } else {
                EndReason::Ended
            },
        },
        Step::Ready { stale } => Event::ProviderReady {
            generation: gen(stale),
        },
        Step::Failed { stale } => Event::ProviderFailed {
            generation: gen(stale),
            error: ProviderError::rejected("refused"),
        },
        Step::Token { stale } => stream(stale, StreamEvent::TokenDelta("tok".into())),
        Step::Complete => stream(false, StreamEvent::TurnComplete),
        Step::Transcript => stream(false, StreamEvent::UserTranscript("spoken".into())),
        Step::Level(level) => stream(false, StreamEvent::AudioLevel(level)),
        Step::StreamError => stream(false, StreamEvent::ProviderError(ProviderError::connection_lost("reset"))),
        Step::Stall { stale_seq } => Event::StallDetected {
            generation: current,
            seq: if stale_seq {
                state.watchdog_seq.saturating_sub(1)
            } else {
                state.watchdog_seq
            },
        },
    }
}

/// Executes effects the way the provider slot does: strictly in order.
#[derive(Default)]
struct SlotModel {
    live: Option<Generation>,
    starts: usize,
    stops: usize,
}

impl SlotModel {
    fn apply(&mut self, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::StartProvider { generation, .. } => {
                    assert!(
                        self.live.is_none(),
                        "generation {} started while {:?} is live",
                        generation,
                        self.live
                    );
                    self.live = Some(*generation);
                    self.starts += 1;
                }
                Effect::StopProvider { generation } => {
                    if self.live == Some(*generation) {
                        self.live = None;
                        self.stops += 1;
                    }
                }
                Effect::SendToProvider { generation, .. }
                | Effect::SetProviderMuted { generation, .. } => {
                    assert_eq!(self.live, Some(*generation), "command for a dead handle");
                }
                Effect::ArmWatchdog { .. } | Effect::DisarmWatchdog | Effect::EmitUi => {}
            }
        }
    }
}

fn check_state(state: &State, slot: &SlotModel) {
    if state.phase.holds_provider() {
        assert_eq!(slot.live, Some(state.generation), "{} without its handle", state.phase);
    } else {
        assert_eq!(slot.live, None, "handle left live in {}", state.phase);
    }

    assert_eq!(
        state.watchdog_armed,
        state.phase.awaiting_reply(),
        "watchdog armed={} in {}",
        state.watchdog_armed,
        state.phase
    );

    let turns = state.transcript.turns();
    let streaming: Vec<_> = turns.iter().enumerate().filter(|(_, t)| t.streaming).collect();
    assert!(streaming.len() <= 1);
    if let Some((index, _)) = streaming.first() {
        assert_eq!(*index, turns.len() - 1, "streaming turn is not the last one");
    }

    match state.phase {
        Phase::Idle => {
            assert!(state.session.is_none());
            assert!(turns.is_empty());
        }
        Phase::Error => {
            assert!(state.error.is_some());
            assert!(!state.transcript.has_streaming_turn());
        }
        _ => assert!(state.session.is_some()),
    }
    assert!((0.0..=1.0).contains(&state.audio_level));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn reducer_keeps_at_most_one_live_handle(steps in prop::collection::vec(step(), 1..60)) {
        let mut state = State::default();
        let mut slot = SlotModel::default();

        for step in steps {
            let event = to_event(&state, step);
            if admit(&state, &event).is_err() {
                continue;
            }
            let previous = state.generation;
            let (next, effects) = reduce(state, event);
            prop_assert!(next.generation >= previous);
            slot.apply(&effects);
            check_state(&next, &slot);
            state = next;
        }

        let (state, effects) = reduce(state, Event::Stop { reason: EndReason::Cancelled });
        slot.apply(&effects);
        prop_assert_eq!(state.phase, Phase::Idle);
        prop_assert_eq!(slot.live, None);
        prop_assert_eq!(slot.starts, slot.stops);
    }
}

// ============================================================================
// Running engine
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Start(usize),
    Switch(usize),
    Send,
    Cancel,
    End,
    Fail,
    Pause(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..3).prop_map(Op::Start),
        3 => (0usize..3).prop_map(Op::Switch),
        2 => Just(Op::Send),
        1 => Just(Op::Cancel),
        1 => Just(Op::End),
        1 => Just(Op::Fail),
        2 => (0u64..4).prop_map(Op::Pause),
    ]
}

const PROVIDERS: [&str; 3] = ["text-fast", "text-slow", "text-slower"];

async fn run_ops(ops: Vec<Op>) {
    let probe = Probe::new();
    let engine = std::sync::Arc::new(common::engine(probe.registry(&[
        (PROVIDERS[0], Modality::Text, Script::replying(&["a", "b"])),
        (PROVIDERS[1], Modality::Text, Script::slow(Duration::from_millis(2))),
        (PROVIDERS[2], Modality::Text, Script::slow(Duration::from_millis(5))),
    ])));

    let mut tasks = tokio::task::JoinSet::new();
    for op in ops {
        if let Op::Pause(ms) = op {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            continue;
        }
        if let Op::Fail = op {
            if probe.sink_count() > 0 {
                probe.sink().error(ProviderError::connection_lost("dropped")).await;
            }
            continue;
        }

        let engine = std::sync::Arc::clone(&engine);
        tasks.spawn(async move {
            let _ = match op {
                Op::Start(i) => engine.start(Modality::Text, PROVIDERS[i]).await.map(|_| ()),
                Op::Switch(i) => engine.switch_provider(PROVIDERS[i]).await,
                Op::Send => engine.send("ping").await,
                Op::Cancel => engine.cancel().await,
                Op::End => engine.end().await,
                Op::Fail | Op::Pause(_) => Ok(()),
            };
        });
    }

    within(Duration::from_secs(10), async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    within(Duration::from_secs(5), engine.cancel()).await.unwrap();

    assert!(probe.max_live() <= 1, "{} handles were live at once", probe.max_live());
    assert_eq!(probe.live(), 0);
    assert_eq!(probe.starts(), probe.stops());
    assert_eq!(engine.snapshot().state, Phase::Idle);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn engine_never_overlaps_provider_handles(ops in prop::collection::vec(op(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops));
    }
}
