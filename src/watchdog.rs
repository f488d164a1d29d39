//! Stall watchdog
//!
//! One timer task per engine. The state machine decides when the timer is
//! armed (a reply is pending) and bumps a sequence number on every decoded
//! event; the watchdog only reports `(generation, seq)` back when the window
//! elapses. The reducer drops reports whose seq is no longer current, so a
//! report that races a fresh token is harmless.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::state_machine::{Event, Generation};

#[derive(Debug, Clone)]
enum Arming {
    Disarmed,
    Armed {
        generation: Generation,
        seq: u64,
        deadline: Instant,
        tx: mpsc::Sender<Event>,
    },
}

pub struct StallWatchdog {
    window: Duration,
    arming: watch::Sender<Arming>,
    task: JoinHandle<()>,
}

impl StallWatchdog {
    /// Must be called from within a tokio runtime.
    pub fn new(window: Duration) -> Self {
        let (arming, rx) = watch::channel(Arming::Disarmed);
        let task = tokio::spawn(run(rx, window));
        Self {
            window,
            arming,
            task,
        }
    }

    /// (Re)start the window. Replaces any earlier arming.
    pub fn arm(&self, generation: Generation, seq: u64, tx: mpsc::Sender<Event>) {
        log::debug!("Watchdog: armed (generation {}, seq {})", generation, seq);
        self.arming.send_replace(Arming::Armed {
            generation,
            seq,
            deadline: Instant::now() + self.window,
            tx,
        });
    }

    pub fn disarm(&self) {
        let previous = self.arming.send_replace(Arming::Disarmed);
        if matches!(previous, Arming::Armed { .. }) {
            log::debug!("Watchdog: disarmed");
        }
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(mut rx: watch::Receiver<Arming>, window: Duration) {
    loop {
        let current = rx.borrow_and_update().clone();

        match current {
            Arming::Disarmed => {
                if rx.changed().await.is_err() {
                    return;
                }
            }
            Arming::Armed {
                generation,
                seq,
                deadline,
                tx,
            } => {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = sleep_until(deadline) => {
                        log::warn!(
                            "Watchdog: no stream data for {:?} (generation {}, seq {})",
                            window,
                            generation,
                            seq
                        );
                        if tx.send(Event::StallDetected { generation, seq }).await.is_err() {
                            log::debug!("Watchdog: engine gone, report dropped");
                        }
                        // Fire once per arming.
                        if rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(15);

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_window() {
        let watchdog = StallWatchdog::new(WINDOW);
        let (tx, mut rx) = mpsc::channel(4);
        let armed_at = Instant::now();

        watchdog.arm(3, 1, tx);
        match rx.recv().await {
            Some(Event::StallDetected { generation, seq }) => {
                assert_eq!((generation, seq), (3, 1));
            }
            other => panic!("expected a stall report, got {:?}", other),
        }
        assert!(armed_at.elapsed() >= WINDOW);

        tokio::time::sleep(WINDOW * 2).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_pushes_the_deadline_out() {
        let watchdog = StallWatchdog::new(WINDOW);
        let (tx, mut rx) = mpsc::channel(4);
        let start = Instant::now();

        watchdog.arm(1, 1, tx.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        watchdog.arm(1, 2, tx);

        assert!(matches!(
            rx.recv().await,
            Some(Event::StallDetected { seq: 2, .. })
        ));
        assert!(start.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels() {
        let watchdog = StallWatchdog::new(WINDOW);
        let (tx, mut rx) = mpsc::channel(4);

        watchdog.arm(1, 1, tx);
        tokio::time::sleep(Duration::from_secs(5)).await;
        watchdog.disarm();
        tokio::time::sleep(WINDOW * 2).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
