//! Metrics collection for the session engine
//!
//! Tracks per-session timing, provider switches, stalls and outcome, plus a
//! bounded error history. Fed by the engine loop from state transitions.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::session::{Modality, ProviderId, SessionId};
use crate::state_machine::EndReason;

/// Maximum number of closed sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Ended,
    Cancelled,
    /// Closed while sitting in the error state.
    Failed,
}

/// Metrics for a closed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub modality: Modality,
    /// Provider in use when the session closed
    pub provider_id: String,
    /// Unix timestamp when the session started (seconds)
    pub started_at: u64,
    pub duration_ms: u64,
    pub provider_switches: u32,
    pub completed_turns: u32,
    /// Average time from request to first token, over replies that got one
    pub avg_first_token_ms: Option<u64>,
    pub stalls: u32,
    pub outcome: SessionOutcome,
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub ended_sessions: u64,
    pub cancelled_sessions: u64,
    pub failed_sessions: u64,
    pub total_stalls: u64,
    /// Average session duration (ms) across retained history
    pub avg_session_ms: u64,
    /// Average first-token latency (ms) across retained history
    pub avg_first_token_ms: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "stalled", "connection_lost", "finalize")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

struct SessionInProgress {
    session_id: SessionId,
    modality: Modality,
    provider_id: ProviderId,
    started_at: Instant,
    started_at_unix: u64,
    switches: u32,
    turns: u32,
    awaiting_since: Option<Instant>,
    first_token_ms: Vec<u64>,
    stalls: u32,
    /// Set while the session is in the error state.
    failure: Option<String>,
}

impl SessionInProgress {
    fn new(session_id: SessionId, modality: Modality, provider_id: ProviderId) -> Self {
        Self {
            session_id,
            modality,
            provider_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            switches: 0,
            turns: 0,
            awaiting_since: None,
            first_token_ms: Vec::new(),
            stalls: 0,
            failure: None,
        }
    }

    fn to_metrics(&self, outcome: SessionOutcome) -> SessionMetrics {
        let avg_first_token_ms = if self.first_token_ms.is_empty() {
            None
        } else {
            Some(self.first_token_ms.iter().sum::<u64>() / self.first_token_ms.len() as u64)
        };

        SessionMetrics {
            session_id: self.session_id.to_string(),
            modality: self.modality,
            provider_id: self.provider_id.to_string(),
            started_at: self.started_at_unix,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            provider_switches: self.switches,
            completed_turns: self.turns,
            avg_first_token_ms,
            stalls: self.stalls,
            outcome,
            error_message: self.failure.clone(),
        }
    }
}

/// Collects and stores metrics for sessions
pub struct MetricsCollector {
    /// History of closed sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
    total_stalls: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
            total_stalls: 0,
        }
    }

    /// Start tracking a session. A session still open (restart from the
    /// error state) is closed as failed first.
    pub fn session_started(&mut self, session_id: SessionId, modality: Modality, provider_id: ProviderId) {
        if let Some(old) = self.current.take() {
            log::debug!(
                "Metrics: closing session {} replaced by {}",
                old.session_id,
                session_id
            );
            self.add_to_history(old.to_metrics(SessionOutcome::Failed));
        }

        log::debug!("Metrics: starting session {} ({}, {})", session_id, modality, provider_id);
        self.current = Some(SessionInProgress::new(session_id, modality, provider_id));
        self.total_sessions += 1;
    }

    pub fn provider_switched(&mut self, provider_id: ProviderId) {
        if let Some(session) = self.current.as_mut() {
            log::info!(
                "Metrics: session {} switched {} -> {}",
                session.session_id,
                session.provider_id,
                provider_id
            );
            session.provider_id = provider_id;
            session.switches += 1;
            session.awaiting_since = None;
            session.failure = None;
        }
    }

    /// A request (text message or spoken turn) went out.
    pub fn request_sent(&mut self) {
        if let Some(session) = self.current.as_mut() {
            session.awaiting_since = Some(Instant::now());
        }
    }

    pub fn first_token(&mut self) {
        if let Some(session) = self.current.as_mut() {
            if let Some(sent) = session.awaiting_since.take() {
                let ms = sent.elapsed().as_millis() as u64;
                log::debug!("Metrics: first token after {}ms", ms);
                session.first_token_ms.push(ms);
            }
        }
    }

    pub fn turn_completed(&mut self) {
        if let Some(session) = self.current.as_mut() {
            session.turns += 1;
            session.awaiting_since = None;
        }
    }

    /// The session entered the error state.
    pub fn session_failed(&mut self, error_type: &str, message: String) {
        let session_id = self.current.as_ref().map(|s| s.session_id.to_string());

        if let Some(session) = self.current.as_mut() {
            if error_type == "stalled" {
                session.stalls += 1;
                self.total_stalls += 1;
            }
            session.awaiting_since = None;
            session.failure = Some(message.clone());
            log::warn!(
                "Metrics: session {} failed ({}) - {}",
                session.session_id,
                error_type,
                message
            );
        }

        self.record_error(error_type.to_string(), message, session_id);
    }

    pub fn session_closed(&mut self, reason: EndReason) {
        if let Some(session) = self.current.take() {
            let outcome = match (reason, session.failure.is_some()) {
                (EndReason::Cancelled, _) => SessionOutcome::Cancelled,
                (EndReason::Ended, true) => SessionOutcome::Failed,
                (EndReason::Ended, false) => SessionOutcome::Ended,
            };
            let metrics = session.to_metrics(outcome);
            log::info!(
                "Metrics: session {} closed ({:?}) after {}ms, {} turns, {} switches",
                metrics.session_id,
                outcome,
                metrics.duration_ms,
                metrics.completed_turns,
                metrics.provider_switches
            );
            self.add_to_history(metrics);
        }
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(&mut self, error_type: String, message: String, session_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let count = |outcome| {
            self.history
                .iter()
                .filter(|s| s.outcome == outcome)
                .count() as u64
        };

        let avg_session_ms = if self.history.is_empty() {
            0
        } else {
            self.history.iter().map(|s| s.duration_ms).sum::<u64>() / self.history.len() as u64
        };

        let latencies: Vec<u64> = self
            .history
            .iter()
            .filter_map(|s| s.avg_first_token_ms)
            .collect();
        let avg_first_token_ms = if latencies.is_empty() {
            0
        } else {
            latencies.iter().sum::<u64>() / latencies.len() as u64
        };

        MetricsSummary {
            total_sessions: self.total_sessions,
            ended_sessions: count(SessionOutcome::Ended),
            cancelled_sessions: count(SessionOutcome::Cancelled),
            failed_sessions: count(SessionOutcome::Failed),
            total_stalls: self.total_stalls,
            avg_session_ms,
            avg_first_token_ms,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Closed sessions, newest first
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Errors, newest first
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_session(&self, session_id: SessionId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.session_id == session_id)
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
