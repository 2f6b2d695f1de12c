//! Send-state reconciliation against the local cache.
//!
//! Every send attempt is written to the cache as `sending` before it goes
//! on the wire, with a bounded timer racing the server's acknowledgment.
//! Whichever resolves the attempt first wins; the loser finds the attempt
//! already claimed and does nothing. A retry abandons the old id with a
//! tombstone and mints a fresh one, so a straggling ack for the abandoned
//! attempt can never resurrect it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use parley_shared::protocol::{ClientFrame, PageCursor, ServerFrame};
use parley_shared::{
    Address, ClientStatus, ConversationKey, DeliveryStatus, Message, MessageId,
    MessageIdGenerator, MessagePayload, UserId,
};
use parley_store::Database;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventSink};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long a send attempt may stay unacknowledged before it is
    /// marked failed.
    pub ack_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Reconciler {
    me: UserId,
    cache: Arc<Mutex<Database>>,
    ids: MessageIdGenerator,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    events: EventSink,
    /// Unresolved attempts and their expiry timers. Removing an entry
    /// claims the attempt; only the claimant may change its status.
    pending: Arc<Mutex<HashMap<MessageId, JoinHandle<()>>>>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        me: UserId,
        cache: Database,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        events: mpsc::UnboundedSender<ClientEvent>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            me,
            cache: Arc::new(Mutex::new(cache)),
            ids: MessageIdGenerator::with_random_producer(),
            outbound,
            events: EventSink::new(events),
            pending: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    /// The local cache, for UI-side reads.
    pub fn cache(&self) -> Result<MutexGuard<'_, Database>> {
        self.cache.lock().map_err(|_| ClientError::LockPoisoned)
    }

    pub fn authenticate(&self, credential: &str) -> Result<()> {
        self.transmit(ClientFrame::Authenticate {
            credential: credential.to_string(),
        })
    }

    pub fn send_text(&self, to: Address, text: impl Into<String>) -> Result<MessageId> {
        self.send_payload(to, MessagePayload::Text(text.into()))
    }

    /// Optimistic send: the attempt is visible locally as `sending` before
    /// the frame leaves, and resolves via ack or expiry.
    pub fn send_payload(&self, to: Address, payload: MessagePayload) -> Result<MessageId> {
        let id = self.ids.next_id();
        let created_at = Utc::now();
        let message = Message {
            id,
            conversation: ConversationKey::for_message(&self.me, &to),
            sender: self.me.clone(),
            recipient: to.clone(),
            payload: payload.clone(),
            created_at,
            status: DeliveryStatus::Queued,
        };

        self.cache()?.cache_insert(&message, ClientStatus::Sending)?;

        if let Err(e) = self.transmit(ClientFrame::Send {
            id,
            to,
            payload,
            created_at,
        }) {
            // Never went on the wire; resolve immediately.
            self.cache()?.set_client_status(id, ClientStatus::Failed)?;
            self.events.emit(ClientEvent::MessageStatus {
                id,
                status: ClientStatus::Failed,
            });
            return Err(e);
        }

        self.arm_expiry(id);
        Ok(id)
    }

    /// Re-send a failed attempt under a fresh id. The old id is
    /// tombstoned first, so its late ack or echo is dropped forever.
    pub fn retry(&self, id: MessageId) -> Result<MessageId> {
        let message = {
            let cache = self.cache()?;
            if cache.client_status(id)? != Some(ClientStatus::Failed) {
                return Err(ClientError::NotFailed(id));
            }
            let message = cache.cache_get(id)?;
            cache.add_tombstone(id)?;
            cache.cache_remove(id)?;
            message
        };
        self.send_payload(message.recipient, message.payload)
    }

    pub fn mark_read(&self, id: MessageId) -> Result<()> {
        self.transmit(ClientFrame::MarkRead { id })
    }

    pub fn load_page(
        &self,
        conversation: ConversationKey,
        before: Option<PageCursor>,
        limit: u32,
    ) -> Result<()> {
        self.transmit(ClientFrame::LoadPage {
            conversation,
            before,
            limit,
        })
    }

    /// Fail out attempts left `sending` by a previous run. Call once on
    /// startup, before any new sends.
    pub fn recover_unresolved(&self) -> Result<usize> {
        let stale = self.cache()?.cache_unresolved_sends(&self.me)?;
        for &id in &stale {
            self.cache()?.set_client_status(id, ClientStatus::Failed)?;
            self.events.emit(ClientEvent::MessageStatus {
                id,
                status: ClientStatus::Failed,
            });
        }
        Ok(stale.len())
    }

    /// Feed one inbound frame from the connection task.
    pub fn handle_server_frame(&self, frame: ServerFrame) -> Result<()> {
        match frame {
            ServerFrame::AuthOk { user } => {
                self.events.emit(ClientEvent::Authenticated(user));
            }
            ServerFrame::AuthErr { reason } => {
                self.events.emit(ClientEvent::AuthFailed(reason));
            }
            ServerFrame::MessageAck { id, .. } => self.resolve_ack(id)?,
            ServerFrame::NewMessage(message) => {
                let inserted = self.cache()?.cache_insert(&message, ClientStatus::Sent)?;
                if inserted {
                    self.events.emit(ClientEvent::NewMessage(message));
                } else {
                    debug!(id = %message.id, "duplicate incoming message dropped");
                }
            }
            ServerFrame::ContactsOnline { online } => {
                self.events.emit(ClientEvent::ContactsOnline(online));
            }
            ServerFrame::Page {
                conversation,
                messages,
                next,
            } => {
                {
                    let cache = self.cache()?;
                    for message in &messages {
                        cache.cache_insert(message, ClientStatus::Sent)?;
                    }
                }
                self.events.emit(ClientEvent::PageLoaded {
                    conversation,
                    messages,
                    next,
                });
            }
            ServerFrame::GroupCreated { group } => {
                self.events.emit(ClientEvent::GroupCreated(group));
            }
            ServerFrame::ForcedLogout { reason } => {
                self.events.emit(ClientEvent::ForcedLogout(reason));
            }
            ServerFrame::Error { message } => {
                self.events.emit(ClientEvent::Rejected(message));
            }
        }
        Ok(())
    }

    /// Stop all expiry timers. Attempts still `sending` stay that way in
    /// the cache and are failed out by [`recover_unresolved`] next run.
    ///
    /// [`recover_unresolved`]: Reconciler::recover_unresolved
    pub fn shutdown(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        for (_, timer) in pending.drain() {
            timer.abort();
        }
    }

    fn transmit(&self, frame: ClientFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| ClientError::TransportClosed)
    }

    fn resolve_ack(&self, id: MessageId) -> Result<()> {
        let timer = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.remove(&id)
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        {
            let cache = self.cache()?;
            if cache.is_tombstoned(id)? {
                debug!(%id, "ack for abandoned attempt dropped");
                return Ok(());
            }
            if !cache.cache_contains(id)? {
                debug!(%id, "ack for unknown message dropped");
                return Ok(());
            }
            if cache.client_status(id)? == Some(ClientStatus::Sent) {
                return Ok(());
            }
            // A late ack for an expired attempt still means the relay
            // stored it; upgrade rather than leave a false failure.
            cache.set_client_status(id, ClientStatus::Sent)?;
        }

        self.events.emit(ClientEvent::MessageStatus {
            id,
            status: ClientStatus::Sent,
        });
        Ok(())
    }

    fn arm_expiry(&self, id: MessageId) {
        let cache = self.cache.clone();
        let pending = self.pending.clone();
        let events = self.events.clone();
        let timeout = self.config.ack_timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let claimed = {
                let mut pending = pending.lock().unwrap_or_else(|p| p.into_inner());
                pending.remove(&id).is_some()
            };
            if !claimed {
                return;
            }

            let Ok(cache) = cache.lock() else {
                warn!(%id, "cache lock poisoned, attempt left unresolved");
                return;
            };
            match cache.set_client_status(id, ClientStatus::Failed) {
                Ok(_) => {
                    drop(cache);
                    events.emit(ClientEvent::MessageStatus {
                        id,
                        status: ClientStatus::Failed,
                    });
                }
                Err(e) => warn!(%id, error = %e, "failed to expire send attempt"),
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.insert(id, timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::protocol::AckStatus;
    use parley_shared::GroupId;

    fn reconciler(
        timeout_ms: u64,
    ) -> (
        tempfile::TempDir,
        Reconciler,
        mpsc::UnboundedReceiver<ClientFrame>,
        mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_cache_at(&dir.path().join("cache.db")).unwrap();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let r = Reconciler::new(
            UserId::new("me"),
            db,
            out_tx,
            ev_tx,
            ReconcilerConfig {
                ack_timeout: Duration::from_millis(timeout_ms),
            },
        );
        (dir, r, out_rx, ev_rx)
    }

    fn incoming(id: u64) -> Message {
        let sender = UserId::new("you");
        let me = UserId::new("me");
        Message {
            id: MessageId(id),
            conversation: ConversationKey::direct(&sender, &me),
            sender,
            recipient: Address::User(me),
            payload: MessagePayload::Text("hey".into()),
            created_at: Utc::now(),
            status: DeliveryStatus::Delivered,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_send_fails_exactly_once() {
        let (_dir, r, mut out, mut events) = reconciler(100);

        let id = r.send_text(Address::User(UserId::new("you")), "hello").unwrap();
        assert!(matches!(out.try_recv().unwrap(), ClientFrame::Send { .. }));
        assert_eq!(
            r.cache().unwrap().client_status(id).unwrap(),
            Some(ClientStatus::Sending)
        );

        // The paused clock advances only when all tasks are idle, so this
        // recv drives the expiry timer to completion.
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ClientEvent::MessageStatus { id: got, status: ClientStatus::Failed } if got == id
        ));
        assert_eq!(
            r.cache().unwrap().client_status(id).unwrap(),
            Some(ClientStatus::Failed)
        );

        // No second resolution.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_before_timeout_marks_sent() {
        let (_dir, r, _out, mut events) = reconciler(100);

        let id = r.send_text(Address::User(UserId::new("you")), "hello").unwrap();
        r.handle_server_frame(ServerFrame::MessageAck {
            id,
            status: AckStatus::Stored,
        })
        .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ClientEvent::MessageStatus { status: ClientStatus::Sent, .. }
        ));

        // The disarmed timer must not flip it to failed later.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(
            r.cache().unwrap().client_status(id).unwrap(),
            Some(ClientStatus::Sent)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ack_resolves_once() {
        let (_dir, r, _out, mut events) = reconciler(100);

        let id = r.send_text(Address::User(UserId::new("you")), "hello").unwrap();
        for _ in 0..2 {
            r.handle_server_frame(ServerFrame::MessageAck {
                id,
                status: AckStatus::Stored,
            })
            .unwrap();
        }

        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::MessageStatus { status: ClientStatus::Sent, .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_mints_a_new_id_and_buries_the_old_one() {
        let (_dir, r, mut out, mut events) = reconciler(50);

        let old = r.send_text(Address::User(UserId::new("you")), "hello").unwrap();
        // Let it expire.
        events.recv().await.unwrap();

        let new = r.retry(old).unwrap();
        assert_ne!(new, old);

        let cache = r.cache().unwrap();
        assert!(cache.is_tombstoned(old).unwrap());
        assert!(!cache.cache_contains(old).unwrap());
        assert_eq!(cache.client_status(new).unwrap(), Some(ClientStatus::Sending));
        drop(cache);

        // The retry put a fresh Send frame on the wire.
        out.try_recv().unwrap();
        assert!(matches!(
            out.try_recv().unwrap(),
            ClientFrame::Send { id, .. } if id == new
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_for_a_retried_attempt_is_dropped() {
        let (_dir, r, _out, mut events) = reconciler(50);

        let old = r.send_text(Address::User(UserId::new("you")), "hello").unwrap();
        events.recv().await.unwrap();
        let new = r.retry(old).unwrap();
        while events.try_recv().is_ok() {}

        // The straggler arrives after the attempt was abandoned.
        r.handle_server_frame(ServerFrame::MessageAck {
            id: old,
            status: AckStatus::Stored,
        })
        .unwrap();

        assert!(events.try_recv().is_err());
        let cache = r.cache().unwrap();
        assert!(!cache.cache_contains(old).unwrap());
        assert_eq!(cache.client_status(new).unwrap(), Some(ClientStatus::Sending));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_of_an_unfailed_message_is_refused() {
        let (_dir, r, _out, _events) = reconciler(100);

        let id = r.send_text(Address::User(UserId::new("you")), "hello").unwrap();
        assert!(matches!(r.retry(id), Err(ClientError::NotFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_duplicates_surface_once() {
        let (_dir, r, _out, mut events) = reconciler(100);

        for _ in 0..2 {
            r.handle_server_frame(ServerFrame::NewMessage(incoming(42))).unwrap();
        }

        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::NewMessage(m) if m.id == MessageId(42)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn page_merge_deduplicates_against_the_cache() {
        let (_dir, r, _out, mut events) = reconciler(100);

        r.handle_server_frame(ServerFrame::NewMessage(incoming(1))).unwrap();
        events.try_recv().unwrap();

        let conversation = incoming(1).conversation;
        r.handle_server_frame(ServerFrame::Page {
            conversation: conversation.clone(),
            messages: vec![incoming(1), incoming(2)],
            next: None,
        })
        .unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::PageLoaded { .. }
        ));
        // Both are present exactly once locally.
        let (local, _) = r
            .cache()
            .unwrap()
            .cache_page(&conversation, None, 10)
            .unwrap();
        let ids: Vec<u64> = local.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sends_fail_on_recovery() {
        let (_dir, r, _out, mut events) = reconciler(100);

        // Simulate a previous run that died mid-send.
        let me = UserId::new("me");
        let msg = Message {
            id: MessageId(9),
            conversation: ConversationKey::direct(&me, &UserId::new("you")),
            sender: me,
            recipient: Address::User(UserId::new("you")),
            payload: MessagePayload::Text("limbo".into()),
            created_at: Utc::now(),
            status: DeliveryStatus::Queued,
        };
        r.cache().unwrap().cache_insert(&msg, ClientStatus::Sending).unwrap();

        assert_eq!(r.recover_unresolved().unwrap(), 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::MessageStatus { id: MessageId(9), status: ClientStatus::Failed }
        ));
        assert_eq!(
            r.cache().unwrap().client_status(MessageId(9)).unwrap(),
            Some(ClientStatus::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn group_sends_use_the_group_conversation() {
        let (_dir, r, mut out, _events) = reconciler(100);

        let group = GroupId::new();
        let id = r.send_text(Address::Group(group), "all hands").unwrap();

        let cached = r.cache().unwrap().cache_get(id).unwrap();
        assert_eq!(cached.conversation, ConversationKey::group(group));
        assert!(matches!(
            out.try_recv().unwrap(),
            ClientFrame::Send { to: Address::Group(g), .. } if g == group
        ));
    }
}
