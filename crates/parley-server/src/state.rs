//! Shared relay state, handed to every connection task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use parley_store::Database;

use crate::auth::IdentityResolver;
use crate::config::ServerConfig;
use crate::delivery::DeliveryLocks;
use crate::error::{Result, ServerError};
use crate::presence::{ConnectionId, PresenceDirectory};

pub struct RelayState {
    pub config: ServerConfig,
    /// The relay log. The mutex is held only for the duration of one
    /// synchronous store call, never across an await.
    pub store: Arc<Mutex<Database>>,
    pub presence: PresenceDirectory,
    pub locks: DeliveryLocks,
    pub resolver: Box<dyn IdentityResolver>,
    next_connection_id: AtomicU64,
}

impl RelayState {
    pub fn new(
        config: ServerConfig,
        store: Arc<Mutex<Database>>,
        resolver: Box<dyn IdentityResolver>,
    ) -> Self {
        Self {
            config,
            store,
            presence: PresenceDirectory::new(),
            locks: DeliveryLocks::default(),
            resolver,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> Result<MutexGuard<'_, Database>> {
        self.store.lock().map_err(|_| ServerError::LockPoisoned)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}
