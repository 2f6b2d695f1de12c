//! Per-connection session handling.
//!
//! One [`Session`] per transport connection. Frames are handled in
//! arrival order; authentication binds the identity into the presence
//! directory (superseding any previous session for it) and flushes the
//! queued backlog before the bind lock is released, so live pushes can
//! only arrive after the replay.

use chrono::Utc;
use parley_shared::protocol::{ClientFrame, ServerFrame};
use parley_shared::{ConversationKey, GroupId, UserId};
use parley_store::Group;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::delivery;
use crate::error::ServerError;
use crate::presence::{ClientHandle, ConnectionId};
use crate::state::RelayState;

pub struct Session {
    state: Arc<RelayState>,
    connection_id: ConnectionId,
    handle: ClientHandle,
    identity: Option<UserId>,
}

impl Session {
    pub fn new(
        state: Arc<RelayState>,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        Self {
            state,
            connection_id,
            handle: ClientHandle::new(connection_id, tx),
            identity: None,
        }
    }

    pub fn identity(&self) -> Option<&UserId> {
        self.identity.as_ref()
    }

    /// Handle one inbound frame. Errors become `Error` frames pushed back
    /// to this connection; they never tear the session down.
    pub async fn handle_frame(&mut self, frame: ClientFrame) {
        let result = match frame {
            ClientFrame::Authenticate { credential } => self.authenticate(&credential).await,
            ClientFrame::Send {
                id,
                to,
                payload,
                created_at,
            } => match self.require_identity() {
                Ok(sender) => {
                    match delivery::send(&self.state, &sender, id, to, payload, created_at).await
                    {
                        Ok(status) => {
                            self.handle.push(ServerFrame::MessageAck { id, status });
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            },
            ClientFrame::MarkRead { id } => self
                .require_identity()
                .and_then(|reader| delivery::mark_read(&self.state, &reader, id)),
            ClientFrame::LoadPage {
                conversation,
                before,
                limit,
            } => self.require_identity().and_then(|me| {
                self.ensure_participant(&me, &conversation)?;
                let limit = limit.min(self.state.config.max_page_size);
                let (messages, next) =
                    self.state.store()?.page_messages(&conversation, before, limit)?;
                self.handle.push(ServerFrame::Page {
                    conversation,
                    messages,
                    next,
                });
                Ok(())
            }),
            ClientFrame::AddFriend { user } => self.require_identity().and_then(|me| {
                let store = self.state.store()?;
                if !store.user_exists(&user)? {
                    return Err(ServerError::UnknownRecipient(user.to_string()));
                }
                store.add_friend_request(&me, &user)?;
                Ok(())
            }),
            ClientFrame::AcceptFriend { user } => self.require_identity().and_then(|me| {
                self.state.store()?.accept_friend(&user, &me)?;
                Ok(())
            }),
            ClientFrame::CreateGroup { name } => self.require_identity().and_then(|me| {
                let group = Group {
                    id: GroupId::new(),
                    name,
                    created_at: Utc::now(),
                };
                let store = self.state.store()?;
                store.create_group(&group)?;
                store.add_group_member(group.id, &me)?;
                self.handle.push(ServerFrame::GroupCreated { group: group.id });
                Ok(())
            }),
            ClientFrame::JoinGroup { group } => self.require_identity().and_then(|me| {
                let store = self.state.store()?;
                if !store.group_exists(group)? {
                    return Err(ServerError::UnknownRecipient(group.to_string()));
                }
                store.add_group_member(group, &me)?;
                Ok(())
            }),
        };

        if let Err(e) = result {
            debug!(connection = self.connection_id, error = %e, "frame rejected");
            self.handle.push(ServerFrame::Error {
                message: e.to_string(),
            });
        }
    }

    /// Resolve the credential, bind the identity, notify any superseded
    /// session, then flush the queued backlog, all under the identity's
    /// delivery lock.
    async fn authenticate(&mut self, credential: &str) -> Result<(), ServerError> {
        let user = match self.state.resolver.resolve(credential) {
            Ok(user) => user,
            Err(e) => {
                warn!(connection = self.connection_id, error = %e, "authentication failed");
                self.handle.push(ServerFrame::AuthErr {
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        let lock = self.state.locks.for_user(&user);
        let _guard = lock.lock().await;

        // This connection may already own another identity; release that
        // binding first or it would keep resolving to a socket that now
        // belongs to someone else. Same socket, so no notice is owed.
        if self.identity.as_ref().is_some_and(|prev| *prev != user) {
            self.state.presence.unbind(self.connection_id);
        }

        if let Some(previous) = self.state.presence.bind(&user, self.handle.clone()) {
            info!(user = %user, "superseding previous session");
            // Notify before teardown so the client can tell "kicked"
            // from a network failure.
            previous.push(ServerFrame::ForcedLogout {
                reason: "signed in from another connection".to_string(),
            });
        }
        self.identity = Some(user.clone());

        self.handle.push(ServerFrame::AuthOk { user: user.clone() });

        let online = self.online_friends(&user)?;
        self.handle.push(ServerFrame::ContactsOnline { online });

        delivery::flush(&self.state, &user, &self.handle).await?;

        info!(user = %user, connection = self.connection_id, "session bound");
        Ok(())
    }

    /// History is only served to the conversation's own participants;
    /// the same gates that protect delivery protect scroll-back.
    fn ensure_participant(
        &self,
        me: &UserId,
        conversation: &ConversationKey,
    ) -> Result<(), ServerError> {
        match conversation {
            ConversationKey::Direct(a, b) => {
                if a != me && b != me {
                    return Err(ServerError::NotParticipant);
                }
            }
            ConversationKey::Group(g) => {
                if !self.state.store()?.is_group_member(*g, me)? {
                    return Err(ServerError::NotGroupMember(*g));
                }
            }
        }
        Ok(())
    }

    fn online_friends(&self, user: &UserId) -> Result<Vec<UserId>, ServerError> {
        let friends = self.state.store()?.list_friends(user)?;
        Ok(friends
            .into_iter()
            .filter(|f| self.state.presence.is_online(f))
            .collect())
    }

    fn require_identity(&self) -> Result<UserId, ServerError> {
        self.identity.clone().ok_or(ServerError::Unauthenticated)
    }

    /// Transport-level disconnect: release the presence binding if this
    /// connection still owns it.
    pub fn close(&self) {
        if let Some(user) = self.state.presence.unbind(self.connection_id) {
            info!(user = %user, connection = self.connection_id, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StoreResolver;
    use crate::config::ServerConfig;
    use parley_shared::protocol::AckStatus;
    use parley_shared::{Address, MessageId, MessagePayload};
    use parley_store::Database;
    use std::sync::Mutex;

    fn relay() -> (tempfile::TempDir, Arc<RelayState>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_relay_at(&dir.path().join("relay.db")).unwrap();
        let store = Arc::new(Mutex::new(db));
        let resolver = Box::new(StoreResolver::new(store.clone(), true));
        let state = Arc::new(RelayState::new(ServerConfig::default(), store, resolver));
        (dir, state)
    }

    fn session(
        state: &Arc<RelayState>,
    ) -> (Session, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = state.next_connection_id();
        (Session::new(state.clone(), conn_id, tx), rx)
    }

    async fn login(s: &mut Session, credential: &str) {
        s.handle_frame(ClientFrame::Authenticate {
            credential: credential.to_string(),
        })
        .await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    fn befriend(state: &Arc<RelayState>, a: &str, b: &str) {
        // Materialise both users through the resolver, then accept.
        state.resolver.resolve(a).unwrap();
        state.resolver.resolve(b).unwrap();
        let store = state.store().unwrap();
        store.add_friend_request(&UserId::new(a), &UserId::new(b)).unwrap();
        store.accept_friend(&UserId::new(a), &UserId::new(b)).unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_send_is_rejected() {
        let (_dir, state) = relay();
        let (mut s, mut rx) = session(&state);

        s.handle_frame(ClientFrame::Send {
            id: MessageId(1),
            to: Address::User(UserId::new("b")),
            payload: MessagePayload::Text("hi".into()),
            created_at: Utc::now(),
        })
        .await;

        assert!(matches!(rx.try_recv().unwrap(), ServerFrame::Error { .. }));
        // Nothing persisted.
        assert!(state.store().unwrap().get_message(MessageId(1)).is_err());
    }

    #[tokio::test]
    async fn offline_message_is_flushed_on_login() {
        let (_dir, state) = relay();
        befriend(&state, "a", "b");

        let (mut sa, mut rx_a) = session(&state);
        login(&mut sa, "a").await;
        drain(&mut rx_a);

        // A sends while B is offline: persisted-only ack.
        sa.handle_frame(ClientFrame::Send {
            id: MessageId(1),
            to: Address::User(UserId::new("b")),
            payload: MessagePayload::Text("hi".into()),
            created_at: Utc::now(),
        })
        .await;
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerFrame::MessageAck {
                id: MessageId(1),
                status: AckStatus::Stored
            }
        ));

        // B logs in and receives exactly the queued message.
        let (mut sb, mut rx_b) = session(&state);
        login(&mut sb, "b").await;
        let frames = drain(&mut rx_b);
        let new_messages: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::NewMessage(m) => Some(m.id),
                _ => None,
            })
            .collect();
        assert_eq!(new_messages, vec![MessageId(1)]);

        // A second login elsewhere gets no replay: msg1 is past queued.
        let (mut sb2, mut rx_b2) = session(&state);
        login(&mut sb2, "b").await;
        let frames = drain(&mut rx_b2);
        assert!(!frames.iter().any(|f| matches!(f, ServerFrame::NewMessage(_))));
    }

    #[tokio::test]
    async fn second_login_supersedes_the_first() {
        let (_dir, state) = relay();

        let (mut s1, mut rx1) = session(&state);
        login(&mut s1, "c").await;
        drain(&mut rx1);

        let (mut s2, _rx2) = session(&state);
        login(&mut s2, "c").await;

        // The first connection is told why it is going away.
        assert!(drain(&mut rx1)
            .iter()
            .any(|f| matches!(f, ServerFrame::ForcedLogout { .. })));

        // The directory points at the newer connection.
        let bound = state.presence.lookup(&UserId::new("c")).unwrap();
        assert_eq!(bound.connection_id(), s2.handle.connection_id());

        // The superseded connection's late disconnect changes nothing.
        s1.close();
        assert!(state.presence.is_online(&UserId::new("c")));
    }

    #[tokio::test]
    async fn reauthenticating_releases_the_previous_identity() {
        let (_dir, state) = relay();

        let (mut s, mut rx) = session(&state);
        login(&mut s, "x").await;
        drain(&mut rx);

        // Same socket presents a different credential.
        login(&mut s, "y").await;
        let frames = drain(&mut rx);

        // The old binding is gone: a message for x must queue, not land on
        // the socket y now owns.
        assert!(state.presence.lookup(&UserId::new("x")).is_none());
        let bound = state.presence.lookup(&UserId::new("y")).unwrap();
        assert_eq!(bound.connection_id(), s.handle.connection_id());

        // Nobody was superseded; the rebind happened on one connection.
        assert!(!frames.iter().any(|f| matches!(f, ServerFrame::ForcedLogout { .. })));

        // Disconnect clears exactly the current identity.
        s.close();
        assert!(state.presence.lookup(&UserId::new("y")).is_none());
    }

    #[tokio::test]
    async fn direct_history_is_limited_to_participants() {
        let (_dir, state) = relay();
        befriend(&state, "a", "b");

        let (mut sa, mut rx_a) = session(&state);
        login(&mut sa, "a").await;
        drain(&mut rx_a);
        sa.handle_frame(ClientFrame::Send {
            id: MessageId(1),
            to: Address::User(UserId::new("b")),
            payload: MessagePayload::Text("private".into()),
            created_at: Utc::now(),
        })
        .await;

        // A third identity asks for the pair's history.
        let (mut sc, mut rx_c) = session(&state);
        login(&mut sc, "c").await;
        drain(&mut rx_c);

        sc.handle_frame(ClientFrame::LoadPage {
            conversation: ConversationKey::direct(&UserId::new("a"), &UserId::new("b")),
            before: None,
            limit: 10,
        })
        .await;

        let frames = drain(&mut rx_c);
        assert!(frames.iter().any(|f| matches!(f, ServerFrame::Error { .. })));
        assert!(!frames.iter().any(|f| matches!(f, ServerFrame::Page { .. })));
    }

    #[tokio::test]
    async fn group_history_requires_membership() {
        let (_dir, state) = relay();

        let (mut sa, mut rx_a) = session(&state);
        login(&mut sa, "a").await;
        sa.handle_frame(ClientFrame::CreateGroup {
            name: "ops".to_string(),
        })
        .await;
        let group = drain(&mut rx_a)
            .iter()
            .find_map(|f| match f {
                ServerFrame::GroupCreated { group } => Some(*group),
                _ => None,
            })
            .unwrap();

        let (mut sc, mut rx_c) = session(&state);
        login(&mut sc, "c").await;
        drain(&mut rx_c);

        sc.handle_frame(ClientFrame::LoadPage {
            conversation: ConversationKey::group(group),
            before: None,
            limit: 10,
        })
        .await;

        let frames = drain(&mut rx_c);
        assert!(frames.iter().any(|f| matches!(f, ServerFrame::Error { .. })));
        assert!(!frames.iter().any(|f| matches!(f, ServerFrame::Page { .. })));
    }

    #[tokio::test]
    async fn login_reports_online_friends() {
        let (_dir, state) = relay();
        befriend(&state, "a", "b");

        let (mut sa, mut rx_a) = session(&state);
        login(&mut sa, "a").await;
        drain(&mut rx_a);

        let (mut sb, mut rx_b) = session(&state);
        login(&mut sb, "b").await;

        let frames = drain(&mut rx_b);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::ContactsOnline { online } if online.contains(&UserId::new("a"))
        )));
    }

    #[tokio::test]
    async fn read_receipts_advance_status() {
        let (_dir, state) = relay();
        befriend(&state, "a", "b");

        let (mut sa, mut rx_a) = session(&state);
        login(&mut sa, "a").await;
        let (mut sb, mut rx_b) = session(&state);
        login(&mut sb, "b").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        sa.handle_frame(ClientFrame::Send {
            id: MessageId(7),
            to: Address::User(UserId::new("b")),
            payload: MessagePayload::Text("hi".into()),
            created_at: Utc::now(),
        })
        .await;

        sb.handle_frame(ClientFrame::MarkRead { id: MessageId(7) }).await;
        assert_eq!(
            state
                .store()
                .unwrap()
                .member_status(MessageId(7), &UserId::new("b"))
                .unwrap(),
            parley_shared::DeliveryStatus::Read
        );
    }

    #[tokio::test]
    async fn paging_round_trip_over_frames() {
        let (_dir, state) = relay();
        befriend(&state, "a", "b");

        let (mut sa, mut rx_a) = session(&state);
        login(&mut sa, "a").await;
        drain(&mut rx_a);

        for id in 1..=3u64 {
            sa.handle_frame(ClientFrame::Send {
                id: MessageId(id),
                to: Address::User(UserId::new("b")),
                payload: MessagePayload::Text(format!("m{id}")),
                created_at: Utc::now(),
            })
            .await;
        }
        drain(&mut rx_a);

        let conversation =
            parley_shared::ConversationKey::direct(&UserId::new("a"), &UserId::new("b"));
        sa.handle_frame(ClientFrame::LoadPage {
            conversation: conversation.clone(),
            before: None,
            limit: 10,
        })
        .await;

        let frames = drain(&mut rx_a);
        let page = frames.iter().find_map(|f| match f {
            ServerFrame::Page { messages, .. } => Some(messages.clone()),
            _ => None,
        });
        let ids: Vec<u64> = page.unwrap().iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
