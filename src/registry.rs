//! Process-wide registry of live sessions, keyed by modality.
//!
//! At most one session per modality may hold a lease. Acquisition is atomic
//! under the registry lock, so two racing `start()` calls cannot both win.
//! Ownership ends when the [`SessionLease`] is dropped.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SessionError;
use crate::session::{Modality, SessionId};

static GLOBAL: Lazy<Arc<SessionRegistry>> = Lazy::new(|| Arc::new(SessionRegistry::new()));

#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<Modality, SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every engine in the process.
    pub fn global() -> Arc<SessionRegistry> {
        GLOBAL.clone()
    }

    /// Claim `modality` for `session_id`. Rejected, never queued, when taken.
    pub fn try_acquire(
        self: &Arc<Self>,
        modality: Modality,
        session_id: SessionId,
    ) -> Result<SessionLease, SessionError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(owner) = active.get(&modality) {
            log::debug!(
                "Registry: {} already owned by session {}, rejecting {}",
                modality,
                owner,
                session_id
            );
            return Err(SessionError::AlreadyActive { modality });
        }
        active.insert(modality, session_id);
        log::debug!("Registry: {} acquired by session {}", modality, session_id);

        Ok(SessionLease {
            registry: Arc::clone(self),
            modality,
            session_id,
        })
    }

    pub fn owner(&self, modality: Modality) -> Option<SessionId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&modality)
            .copied()
    }

    pub fn is_active(&self, modality: Modality) -> bool {
        self.owner(modality).is_some()
    }

    fn release(&self, modality: Modality, session_id: SessionId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(&modality) == Some(&session_id) {
            active.remove(&modality);
            log::debug!("Registry: {} released by session {}", modality, session_id);
        }
    }

    fn reassign(&self, modality: Modality, from: SessionId, to: SessionId) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get_mut(&modality) {
            Some(owner) if *owner == from => {
                *owner = to;
                true
            }
            _ => false,
        }
    }
}

/// Ownership of one modality slot. Released on drop.
#[derive(Debug)]
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    modality: Modality,
    session_id: SessionId,
}

impl SessionLease {
    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Hand the slot to another session without releasing it in between.
    pub fn transfer(&mut self, session_id: SessionId) {
        if self
            .registry
            .reassign(self.modality, self.session_id, session_id)
        {
            log::debug!(
                "Registry: {} transferred from {} to {}",
                self.modality,
                self.session_id,
                session_id
            );
            self.session_id = session_id;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(self.modality, self.session_id);
    }
}
