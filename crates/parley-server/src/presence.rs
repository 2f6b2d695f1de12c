//! The presence directory: the single source of truth for "is user X
//! reachable right now".
//!
//! Maps identity -> active connection and connection -> identity. At most
//! one active connection per identity: binding a new connection for an
//! identity evicts and returns the previous handle so the session layer
//! can notify it before tearing it down.
//!
//! The lock is never held across an await; every operation is a short map
//! update.

use std::collections::HashMap;
use std::sync::Mutex;

use parley_shared::protocol::ServerFrame;
use parley_shared::UserId;
use tokio::sync::mpsc;

/// Process-unique id for one transport connection.
pub type ConnectionId = u64;

/// Push side of one live connection.
#[derive(Clone)]
pub struct ClientHandle {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl ClientHandle {
    pub fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Fire-and-forget push. Returns `false` when the connection is dead;
    /// callers treat that as "recipient offline" and leave the message
    /// queued; the transport's own disconnect event corrects the
    /// directory, not this failure.
    pub fn push(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

#[derive(Default)]
struct Inner {
    by_user: HashMap<UserId, ClientHandle>,
    by_conn: HashMap<ConnectionId, UserId>,
}

#[derive(Default)]
pub struct PresenceDirectory {
    inner: Mutex<Inner>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` as online on `handle`.
    ///
    /// Returns the superseded handle when the identity was already bound
    /// to a different connection; the caller must send it a forced-logout
    /// notice before (or while) closing it.
    pub fn bind(&self, user: &UserId, handle: ClientHandle) -> Option<ClientHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let previous = inner.by_user.insert(user.clone(), handle.clone());
        if let Some(prev) = &previous {
            inner.by_conn.remove(&prev.connection_id());
        }
        inner.by_conn.insert(handle.connection_id(), user.clone());

        previous.filter(|prev| prev.connection_id() != handle.connection_id())
    }

    /// Remove the mapping owned by `connection`, if any.
    ///
    /// A no-op for connections that never authenticated or were already
    /// superseded: a stale unbind never removes a newer binding.
    pub fn unbind(&self, connection: ConnectionId) -> Option<UserId> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let user = inner.by_conn.remove(&connection)?;
        let still_owner = inner
            .by_user
            .get(&user)
            .is_some_and(|h| h.connection_id() == connection);
        if still_owner {
            inner.by_user.remove(&user);
        }
        Some(user)
    }

    /// Non-blocking lookup used by the delivery engine for push-vs-queue.
    pub fn lookup(&self, user: &UserId) -> Option<ClientHandle> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.by_user.get(user).cloned()
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.by_user.contains_key(user)
    }

    /// All currently online identities, for bulk presence annotation.
    pub fn all(&self) -> Vec<UserId> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.by_user.keys().cloned().collect()
    }
}
