//! Conversational session engine.
//!
//! Drives one live AI conversation (text chat or voice call) through its
//! lifecycle across interchangeable backend providers:
//!
//! - [`state_machine`]: pure `admit` + `reduce` over the session state
//! - [`engine`]: the single-writer loop and the public async API
//! - [`effects`]: runs provider and watchdog effects, one provider at a time
//! - [`providers`]: adapter contract and the text / realtime voice adapters
//! - [`streaming`]: transports, wire protocol and frame decoding
//!
//! ```no_run
//! # async fn demo() -> Result<(), session_engine::SessionError> {
//! use session_engine::{load_settings, Modality, SessionEngine};
//!
//! let engine = SessionEngine::new(load_settings());
//! engine.consent().grant().ok();
//! let mut observer = engine.start(Modality::Text, "text-default").await?;
//! engine.send("hello").await?;
//! observer.wait_for(|s| s.state.as_str() == "listening").await;
//! engine.end().await?;
//! # Ok(())
//! # }
//! ```

pub mod consent;
pub mod credentials;
pub mod effects;
pub mod engine;
pub mod error;
pub mod finalizer;
mod http;
pub mod metrics;
pub mod providers;
pub mod registry;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;
pub mod watchdog;

pub use consent::{ConsentGate, ConsentRecord, ConsentStatus, FileConsentStore, MemoryConsentStore};
pub use engine::{SessionEngine, SessionEngineBuilder, SessionObserver, SessionSnapshot};
pub use error::{FinalizeError, ProviderError, ProviderErrorKind, SessionError, SessionFault};
pub use finalizer::{Finalizer, HttpFinalizer, SessionSummary};
pub use metrics::{MetricsCollector, MetricsSummary, SessionMetrics, SessionOutcome};
pub use providers::{ProviderAdapter, ProviderRegistry};
pub use registry::{SessionLease, SessionRegistry};
pub use session::{Modality, ProviderId, Role, SessionId, SessionInfo, Transcript, Turn, TurnRecord};
pub use settings::{load_settings, save_settings, EngineSettings};
pub use state_machine::{EndReason, Phase};
