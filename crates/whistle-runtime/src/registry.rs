//! Live conversations keyed by id.
//!
//! Each conversation sits behind its own async mutex. Operations take it
//! with `try_lock`, so two concurrent operations on one conversation never
//! interleave: the second is refused with [`RegistryError::Busy`] instead of
//! waiting. Different conversations never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};
use whistle_core::{Conversation, ConversationId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    #[error("conversation {0} is busy")]
    Busy(ConversationId),
}

/// Exclusive access to one conversation for the duration of an operation.
pub type ConversationGuard = OwnedMutexGuard<Conversation>;

pub struct ConversationRegistry {
    slots: Mutex<HashMap<ConversationId, Arc<AsyncMutex<Conversation>>>>,
    ttl: Duration,
}

impl ConversationRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, conversation: Conversation) {
        let id = conversation.id().clone();
        self.slots
            .lock()
            .insert(id, Arc::new(AsyncMutex::new(conversation)));
    }

    /// Lock a conversation for an operation.
    ///
    /// Expired conversations are removed and reported as not found.
    pub fn acquire(&self, id: &ConversationId) -> Result<ConversationGuard, RegistryError> {
        let slot = self
            .slots
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let guard = slot
            .try_lock_owned()
            .map_err(|_| RegistryError::Busy(id.clone()))?;

        if self.is_expired(&guard) {
            debug!(conversation = %id, "Conversation expired");
            self.slots.lock().remove(id);
            return Err(RegistryError::NotFound(id.clone()));
        }
        Ok(guard)
    }

    fn is_expired(&self, conversation: &Conversation) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return false;
        };
        Utc::now() - conversation.last_activity() > ttl
    }

    /// Drop idle conversations. Conversations currently in use are skipped.
    pub fn purge_expired(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(conversation) => !self.is_expired(&conversation),
            Err(_) => true,
        });
        let purged = before - slots.len();
        if purged > 0 {
            info!(purged, remaining = slots.len(), "Purged expired conversations");
        }
        purged
    }

    pub fn remove(&self, id: &ConversationId) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
