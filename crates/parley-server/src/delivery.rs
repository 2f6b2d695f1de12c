//! The delivery engine: push-or-queue on send, ordered flush on bind.
//!
//! Every delivery decision for a recipient happens under that recipient's
//! delivery lock. Bind-and-flush takes the same lock, so a send racing a
//! reconnect either lands before the flush reads the queue (and is
//! replayed by it) or waits and is pushed live afterwards; the recipient
//! never observes reordering between the two paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use parley_shared::protocol::{AckStatus, ServerFrame};
use parley_shared::{
    Address, ConversationKey, DeliveryStatus, Message, MessageId, MessagePayload, UserId,
};
use tracing::{debug, info};

use crate::error::{Result, ServerError};
use crate::presence::ClientHandle;
use crate::state::RelayState;

/// Per-identity async locks serialising delivery decisions.
#[derive(Default)]
pub struct DeliveryLocks {
    inner: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeliveryLocks {
    pub fn for_user(&self, user: &UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entry(user.clone()).or_default().clone()
    }
}

/// Handle a produced message: validate, persist, then push or queue per
/// recipient. Returns the acknowledgment owed to the sender.
pub async fn send(
    state: &RelayState,
    sender: &UserId,
    id: MessageId,
    to: Address,
    payload: MessagePayload,
    created_at: DateTime<Utc>,
) -> Result<AckStatus> {
    match to {
        Address::User(recipient) => {
            send_private(state, sender, id, recipient, payload, created_at).await
        }
        Address::Group(group) => {
            send_group(state, sender, id, group, payload, created_at).await
        }
    }
}

async fn send_private(
    state: &RelayState,
    sender: &UserId,
    id: MessageId,
    recipient: UserId,
    payload: MessagePayload,
    created_at: DateTime<Utc>,
) -> Result<AckStatus> {
    let message = {
        let store = state.store()?;
        if !store.user_exists(&recipient)? {
            return Err(ServerError::UnknownRecipient(recipient.to_string()));
        }
        if !store.are_friends(sender, &recipient)? {
            return Err(ServerError::NotFriends(recipient));
        }

        let message = Message {
            id,
            conversation: ConversationKey::direct(sender, &recipient),
            sender: sender.clone(),
            recipient: Address::User(recipient.clone()),
            payload,
            created_at,
            status: DeliveryStatus::Queued,
        };

        match store.append_message(&message, &[]) {
            Ok(()) => {}
            // The producer's intent is already satisfied.
            Err(parley_store::StoreError::DuplicateId(id)) => {
                debug!(%id, "duplicate send, already persisted");
                return Ok(AckStatus::Stored);
            }
            Err(e) => return Err(e.into()),
        }
        message
    };

    Ok(deliver_to(state, &recipient, message).await?)
}

/// Group sends always ack `Stored`: delivery advances per member in the
/// log, so a single `Delivered` could not say which members it covers.
async fn send_group(
    state: &RelayState,
    sender: &UserId,
    id: MessageId,
    group: parley_shared::GroupId,
    payload: MessagePayload,
    created_at: DateTime<Utc>,
) -> Result<AckStatus> {
    let (message, members) = {
        let store = state.store()?;
        if !store.group_exists(group)? {
            return Err(ServerError::UnknownRecipient(group.to_string()));
        }
        if !store.is_group_member(group, sender)? {
            return Err(ServerError::NotGroupMember(group));
        }

        let members: Vec<UserId> = store
            .list_group_members(group)?
            .into_iter()
            .filter(|m| m != sender)
            .collect();

        let message = Message {
            id,
            conversation: ConversationKey::group(group),
            sender: sender.clone(),
            recipient: Address::Group(group),
            payload,
            created_at,
            status: DeliveryStatus::Queued,
        };

        match store.append_message(&message, &members) {
            Ok(()) => {}
            Err(parley_store::StoreError::DuplicateId(id)) => {
                debug!(%id, "duplicate group send, already persisted");
                return Ok(AckStatus::Stored);
            }
            Err(e) => return Err(e.into()),
        }
        (message, members)
    };

    // One member being offline must not block delivery to the others;
    // each copy advances independently.
    for member in &members {
        deliver_to(state, member, message.clone()).await?;
    }

    Ok(AckStatus::Stored)
}

/// Push one recipient's copy if they are reachable, under their delivery
/// lock. A dead handle is "offline": the copy simply stays queued.
async fn deliver_to(
    state: &RelayState,
    recipient: &UserId,
    message: Message,
) -> Result<AckStatus> {
    let lock = state.locks.for_user(recipient);
    let _guard = lock.lock().await;

    let Some(handle) = state.presence.lookup(recipient) else {
        return Ok(AckStatus::Stored);
    };

    let id = message.id;
    if !handle.push(ServerFrame::NewMessage(message)) {
        debug!(%id, recipient = %recipient, "push to dead connection, leaving queued");
        return Ok(AckStatus::Stored);
    }

    state.store()?.mark_delivered(id, recipient)?;
    Ok(AckStatus::Delivered)
}

/// Replay every queued message for `user` over `handle`, in send order,
/// marking each delivered as it is pushed.
///
/// The caller must hold `user`'s delivery lock (the bind path does), so
/// concurrently produced messages wait and arrive after the replay.
pub async fn flush(state: &RelayState, user: &UserId, handle: &ClientHandle) -> Result<usize> {
    let queued = state.store()?.list_queued(user)?;
    let total = queued.len();

    let mut flushed = 0;
    for message in queued {
        let id = message.id;
        if !handle.push(ServerFrame::NewMessage(message)) {
            // Connection died mid-flush; the rest stays queued for the
            // next bind.
            debug!(user = %user, flushed, total, "flush interrupted by dead connection");
            break;
        }
        state.store()?.mark_delivered(id, user)?;
        flushed += 1;
    }

    if flushed > 0 {
        info!(user = %user, flushed, "flushed queued messages");
    }
    Ok(flushed)
}

/// The recipient confirmed display of a message. Monotonic.
pub fn mark_read(state: &RelayState, reader: &UserId, id: MessageId) -> Result<()> {
    state.store()?.mark_read(id, reader)?;
    Ok(())
}
