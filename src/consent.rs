//! Consent gate for AI-backed modalities.
//!
//! The gate is a read-mostly state holder consulted by `start()`. The record
//! only changes through an explicit user action (`grant` / `deny`) and is
//! persisted through a [`ConsentStore`] so it outlives any session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

use crate::session::Modality;
use crate::settings::{config_dir, write_atomic};

const CONSENT_FILE_NAME: &str = "consent.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    #[default]
    Unknown,
    Granted,
    Denied,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Unknown => "unknown",
            ConsentStatus::Granted => "granted",
            ConsentStatus::Denied => "denied",
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, ConsentStatus::Granted)
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsentRecord {
    pub status: ConsentStatus,
    /// When the user last changed the record. `None` until the first decision.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    fn decided(status: ConsentStatus) -> Self {
        Self {
            status,
            updated_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsentStoreError {
    #[error("consent file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("consent file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence for the single consent record.
pub trait ConsentStore: Send + Sync + 'static {
    fn load(&self) -> Result<ConsentRecord, ConsentStoreError>;
    fn save(&self, record: &ConsentRecord) -> Result<(), ConsentStoreError>;
}

/// JSON file store, written atomically.
pub struct FileConsentStore {
    path: PathBuf,
}

impl FileConsentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/session-engine/consent.json`, if a config dir exists.
    pub fn default_location() -> Option<Self> {
        config_dir().map(|dir| Self::new(dir.join(CONSENT_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConsentStore for FileConsentStore {
    fn load(&self) -> Result<ConsentRecord, ConsentStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConsentRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, record: &ConsentRecord) -> Result<(), ConsentStoreError> {
        let contents = serde_json::to_string_pretty(record)?;
        write_atomic(&self.path, &contents)?;
        Ok(())
    }
}

/// In-process store; nothing survives the process.
#[derive(Default)]
pub struct MemoryConsentStore {
    record: Mutex<ConsentRecord>,
}

impl MemoryConsentStore {
    pub fn new(status: ConsentStatus) -> Self {
        Self {
            record: Mutex::new(ConsentRecord {
                status,
                updated_at: None,
            }),
        }
    }
}

impl ConsentStore for MemoryConsentStore {
    fn load(&self) -> Result<ConsentRecord, ConsentStoreError> {
        Ok(self
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, record: &ConsentRecord) -> Result<(), ConsentStoreError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record.clone();
        Ok(())
    }
}

pub struct ConsentGate {
    store: Box<dyn ConsentStore>,
    record: RwLock<ConsentRecord>,
    ai_modalities: HashSet<Modality>,
}

impl ConsentGate {
    /// Load the persisted record. A missing or unreadable record counts as `Unknown`.
    pub fn new(store: impl ConsentStore) -> Self {
        let record = match store.load() {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Consent: failed to load record, treating as unknown: {}", e);
                ConsentRecord::default()
            }
        };
        log::debug!("Consent: loaded status {}", record.status);

        Self {
            store: Box::new(store),
            record: RwLock::new(record),
            ai_modalities: [Modality::Text, Modality::Voice].into_iter().collect(),
        }
    }

    pub fn in_memory(status: ConsentStatus) -> Self {
        Self::new(MemoryConsentStore::new(status))
    }

    /// Restrict gating to the given modalities. Others bypass the gate.
    pub fn with_ai_modalities(mut self, modalities: impl IntoIterator<Item = Modality>) -> Self {
        self.ai_modalities = modalities.into_iter().collect();
        self
    }

    pub fn is_ai_modality(&self, modality: Modality) -> bool {
        self.ai_modalities.contains(&modality)
    }

    pub fn status(&self) -> ConsentStatus {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn record(&self) -> ConsentRecord {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Consent status that applies to `modality`. Non-AI modalities report `Granted`.
    pub fn require_consent(&self, modality: Modality) -> ConsentStatus {
        if self.is_ai_modality(modality) {
            self.status()
        } else {
            ConsentStatus::Granted
        }
    }

    pub fn grant(&self) -> Result<(), ConsentStoreError> {
        self.set(ConsentStatus::Granted)
    }

    pub fn deny(&self) -> Result<(), ConsentStoreError> {
        self.set(ConsentStatus::Denied)
    }

    /// Persist first, then update the in-memory copy.
    pub fn set(&self, status: ConsentStatus) -> Result<(), ConsentStoreError> {
        let record = ConsentRecord::decided(status);
        self.store.save(&record)?;
        *self.record.write().unwrap_or_else(PoisonError::into_inner) = record;
        log::info!("Consent: status set to {}", status);
        Ok(())
    }
}
