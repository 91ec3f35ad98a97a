// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified pairwise messaging: blocking request/reply and queued sends over
//! one session concept.
//!
//! `send_and_wait` holds the session advisory lock plus `locked_agent_id`
//! for its whole critical section; `send_no_wait` holds neither (it is a
//! queued write and must never block on a peer's pending request).

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, InvokeError};
use crate::lock::{spawn_cleanup, LockGuard};
use crate::model::{
    clean_endpoint_pair, clean_external_id, Agent, HandlerKind, MessageContext, MessageType,
    Session, SessionOverview, SessionStatus,
};
use crate::store::{NewMessage, Store};
use crate::waiter::{Delivery, WaitOutcome, WaiterTable};

use std::sync::Arc;

/// Deadline for the synchronous handler fast path.
const FAST_PATH_DEADLINE: Duration = Duration::from_millis(100);

/// Upper bound on caller-supplied blocking timeouts.
const MAX_WAIT: Duration = Duration::from_secs(300);

/// Serialize a message body for storage. JSON objects are stored as-is;
/// anything else is wrapped so the column is always a document. Objects
/// round-trip bit-identically.
pub(crate) fn wrap_content(message: Value) -> Value {
    match message {
        Value::Object(_) => message,
        other => json!({ "data": other }),
    }
}

/// Clears `locked_agent_id` and releases the session advisory lock — in
/// that order — on every exit path, including cancellation.
struct SessionGuard {
    store: Store,
    session_id: Uuid,
    lock: Option<LockGuard>,
}

impl SessionGuard {
    /// Normal path: unlock explicitly so persistence failures surface.
    async fn release(mut self) -> Result<()> {
        self.store.set_locked_agent(self.session_id, None).await?;
        if let Some(lock) = self.lock.take() {
            lock.release().await?;
        }
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let store = self.store.clone();
        let session_id = self.session_id;
        debug!(%session_id, "releasing session guard from drop");
        spawn_cleanup(async move {
            if let Err(err) = store.set_locked_agent(session_id, None).await {
                warn!(%session_id, error = %err, "failed to clear locked agent in cleanup");
            }
            if let Err(err) = lock.release().await {
                warn!(%session_id, error = %err, "failed to release session lock in cleanup");
            }
        });
    }
}

pub struct Conversation {
    store: Store,
    registry: Arc<HandlerRegistry>,
    waiters: Arc<WaiterTable>,
}

impl Conversation {
    pub(crate) fn new(
        store: Store,
        registry: Arc<HandlerRegistry>,
        waiters: Arc<WaiterTable>,
    ) -> Self {
        Self {
            store,
            registry,
            waiters,
        }
    }

    async fn agent(&self, external_id: &str) -> Result<Agent> {
        self.store
            .agent_by_external_id(external_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(external_id.to_owned()))
    }

    async fn context(
        &self,
        sender: &Agent,
        receiver: &Agent,
        handler_kind: HandlerKind,
        message_id: Uuid,
        session_id: Option<Uuid>,
        metadata: Value,
    ) -> Result<MessageContext> {
        let organization_id = self
            .store
            .organization_of_agent(sender.id)
            .await?
            .map(|org| org.external_id)
            .unwrap_or_else(|| "unknown".to_owned());
        Ok(MessageContext {
            sender_id: sender.external_id.clone(),
            receiver_id: receiver.external_id.clone(),
            organization_id,
            handler_kind,
            message_id,
            session_id,
            meeting_id: None,
            metadata,
        })
    }

    /// Look up or lazily create the active session for the pair, then take
    /// exclusive write access: advisory lock on a pinned connection plus
    /// `locked_agent_id = sender`.
    async fn acquire_session(
        &self,
        sender: &Agent,
        recipient: &Agent,
    ) -> Result<(Session, SessionGuard)> {
        let session = self
            .store
            .get_or_create_active_session(sender.id, recipient.id)
            .await?;
        if session.status != SessionStatus::Active {
            return Err(Error::SessionState(format!(
                "session {} is not active (status {})",
                session.id, session.status
            )));
        }
        if let Some(holder_id) = session.locked_agent_id {
            let holder = self
                .store
                .agent_by_id(holder_id)
                .await?
                .map(|a| a.external_id)
                .unwrap_or_else(|| holder_id.to_string());
            return Err(Error::LockUnavailable(format!(
                "session {} is held by {holder}",
                session.id
            )));
        }
        let lock = LockGuard::acquire(self.store.pool(), session.id).await?;
        let guard = SessionGuard {
            store: self.store.clone(),
            session_id: session.id,
            lock: Some(lock),
        };
        self.store
            .set_locked_agent(session.id, Some(sender.id))
            .await?;
        Ok((session, guard))
    }

    /// Send a message and block until the counterpart replies or `timeout`
    /// elapses. Requires a registered `conversation` handler.
    pub async fn send_and_wait(
        &self,
        sender_external_id: &str,
        recipient_external_id: &str,
        message: Value,
        timeout: Duration,
        metadata: Option<Value>,
    ) -> Result<Value> {
        let (sender_ext, recipient_ext) =
            clean_endpoint_pair(sender_external_id, recipient_external_id)?;
        if timeout.is_zero() || timeout > MAX_WAIT {
            return Err(Error::Validation(format!(
                "timeout must be in (0, {}] seconds",
                MAX_WAIT.as_secs()
            )));
        }
        if !self.registry.has(HandlerKind::Conversation) {
            return Err(Error::NoHandlerRegistered(HandlerKind::Conversation));
        }

        let sender = self.agent(&sender_ext).await?;
        let recipient = self.agent(&recipient_ext).await?;
        let metadata = metadata.unwrap_or_else(|| json!({}));

        let (session, guard) = self.acquire_session(&sender, &recipient).await?;
        info!(session_id = %session.id, sender = %sender_ext, recipient = %recipient_ext,
              "blocking send started");

        // Register before persisting the outbound message: a reply cannot
        // beat the waiter into the table.
        let handle = self.waiters.register(session.id, sender.id);

        let content = wrap_content(message.clone());
        let message_id = self
            .store
            .insert_message(NewMessage {
                sender_id: Some(sender.id),
                recipient_id: Some(recipient.id),
                session_id: Some(session.id),
                meeting_id: None,
                message_type: MessageType::UserDefined,
                content: content.clone(),
                metadata: metadata.clone(),
            })
            .await?;

        // A recipient parked in get_or_wait_for_response on this session
        // gets the outbound message pushed straight to it.
        self.waiters.try_wake(
            session.id,
            recipient.id,
            Some(Delivery {
                message_id,
                content,
            }),
        );

        let context = self
            .context(
                &sender,
                &recipient,
                HandlerKind::Conversation,
                message_id,
                Some(session.id),
                metadata.clone(),
            )
            .await?;

        // Handler fast path: a short synchronous window for handlers that
        // can answer immediately.
        match self
            .registry
            .invoke_sync(
                HandlerKind::Conversation,
                message.clone(),
                context.clone(),
                FAST_PATH_DEADLINE,
            )
            .await
        {
            Ok(Some(reply)) => {
                let reply_id = self
                    .store
                    .insert_message(NewMessage {
                        sender_id: Some(recipient.id),
                        recipient_id: Some(sender.id),
                        session_id: Some(session.id),
                        meeting_id: None,
                        message_type: MessageType::UserDefined,
                        content: wrap_content(reply.clone()),
                        metadata: json!({}),
                    })
                    .await?;
                self.store.mark_read(reply_id).await?;
                drop(handle);
                guard.release().await?;
                info!(session_id = %session.id, %reply_id, "fast-path reply auto-persisted");
                return Ok(reply);
            }
            Ok(None) => {
                // Handler finished without a reply; the counterpart will
                // answer out-of-band.
            }
            Err(InvokeError::Missing(kind)) => {
                return Err(Error::NoHandlerRegistered(kind));
            }
            Err(InvokeError::Deadline(_)) => {
                self.registry.invoke_detached(
                    HandlerKind::Conversation,
                    message.clone(),
                    context.clone(),
                );
            }
            Err(InvokeError::Failed(err)) => {
                // Fast-path failures do not abort the wait; re-dispatch
                // detached so the handler can retry or reply out-of-band.
                warn!(session_id = %session.id, error = %err, "conversation handler failed in fast path");
                self.registry.invoke_detached(
                    HandlerKind::Conversation,
                    message.clone(),
                    context.clone(),
                );
            }
        }

        // The handler may have replied through a side channel before the
        // fast-path window closed.
        if let Some(reply) = self.store.first_unread_from(sender.id, recipient.id).await? {
            self.store.mark_read(reply.id).await?;
            drop(handle);
            guard.release().await?;
            return Ok(reply.content);
        }

        match handle.wait(Some(timeout)).await {
            WaitOutcome::Woken(Some(delivery)) => {
                self.store.mark_read(delivery.message_id).await?;
                guard.release().await?;
                Ok(delivery.content)
            }
            WaitOutcome::Woken(None) | WaitOutcome::Replaced => {
                let reply = self.store.first_unread_from(sender.id, recipient.id).await?;
                match reply {
                    Some(reply) => {
                        self.store.mark_read(reply.id).await?;
                        guard.release().await?;
                        Ok(reply.content)
                    }
                    None => {
                        // Woken with nothing to collect (ended session or a
                        // drained shutdown); treat as an elapsed wait.
                        guard.release().await?;
                        Err(Error::Timeout(timeout))
                    }
                }
            }
            WaitOutcome::TimedOut => {
                guard.release().await?;
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Queue a message without blocking. Wakes a parked counterpart if one
    /// is waiting on this session; otherwise pushes a notification to the
    /// idle recipient.
    pub async fn send_no_wait(
        &self,
        sender_external_id: &str,
        recipient_external_id: &str,
        message: Value,
        metadata: Option<Value>,
    ) -> Result<Uuid> {
        let (sender_ext, recipient_ext) =
            clean_endpoint_pair(sender_external_id, recipient_external_id)?;
        let sender = self.agent(&sender_ext).await?;
        let recipient = self.agent(&recipient_ext).await?;
        let metadata = metadata.unwrap_or_else(|| json!({}));

        // Deliberately lockless: this path must not block on a peer's
        // send_and_wait.
        let session = self
            .store
            .get_or_create_active_session(sender.id, recipient.id)
            .await?;

        let content = wrap_content(message.clone());
        let message_id = self
            .store
            .insert_message(NewMessage {
                sender_id: Some(sender.id),
                recipient_id: Some(recipient.id),
                session_id: Some(session.id),
                meeting_id: None,
                message_type: MessageType::UserDefined,
                content: content.clone(),
                metadata: metadata.clone(),
            })
            .await?;

        let context = self
            .context(
                &sender,
                &recipient,
                HandlerKind::Conversation,
                message_id,
                Some(session.id),
                metadata,
            )
            .await?;
        if self.registry.has(HandlerKind::Conversation) {
            self.registry
                .invoke_detached(HandlerKind::Conversation, message, context.clone());
        }

        let woken = self.waiters.try_wake(
            session.id,
            recipient.id,
            Some(Delivery {
                message_id,
                content,
            }),
        );
        if woken {
            debug!(session_id = %session.id, %message_id, "queued message woke a parked caller");
        } else if self.registry.has(HandlerKind::Notification)
            && !self.store.is_agent_locked(recipient.id).await?
        {
            // Push hook for idle recipients. Silent while the recipient is
            // blocked inside its own send_and_wait, to not double-signal.
            let notify_ctx = MessageContext {
                handler_kind: HandlerKind::Notification,
                ..context
            };
            self.registry
                .invoke_detached(HandlerKind::Notification, json!({}), notify_ctx);
        }

        info!(session_id = %session.id, %message_id, sender = %sender_ext,
              recipient = %recipient_ext, "queued message sent");
        Ok(message_id)
    }

    /// Check the queue for a message from `sender`, parking until one
    /// arrives when the queue is empty. Returns `None` on timeout.
    pub async fn get_or_wait_for_response(
        &self,
        receiver_external_id: &str,
        sender_external_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>> {
        let (receiver_ext, sender_ext) =
            clean_endpoint_pair(receiver_external_id, sender_external_id)?;
        let receiver = self.agent(&receiver_ext).await?;
        let sender = self.agent(&sender_ext).await?;

        if let Some(existing) = self
            .store
            .first_unread_from(receiver.id, sender.id)
            .await?
        {
            self.store.mark_read(existing.id).await?;
            return Ok(Some(existing.content));
        }

        let session = self
            .store
            .get_or_create_active_session(sender.id, receiver.id)
            .await?;
        let handle = self.waiters.register(session.id, receiver.id);

        // A send racing the registration may have landed already.
        if let Some(existing) = self
            .store
            .first_unread_from(receiver.id, sender.id)
            .await?
        {
            self.store.mark_read(existing.id).await?;
            return Ok(Some(existing.content));
        }

        let outcome = handle.wait(timeout).await;
        match outcome {
            WaitOutcome::Woken(Some(delivery)) => {
                self.store.mark_read(delivery.message_id).await?;
                Ok(Some(delivery.content))
            }
            WaitOutcome::Woken(None) | WaitOutcome::Replaced | WaitOutcome::TimedOut => {
                // Final re-check catches a send_no_wait that raced the park.
                match self.store.first_unread_from(receiver.id, sender.id).await? {
                    Some(message) => {
                        self.store.mark_read(message.id).await?;
                        Ok(Some(message.content))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// End the active conversation between two agents. The second call for
    /// the same pair fails with [`Error::SessionState`] and changes nothing.
    pub async fn end_conversation(
        &self,
        agent_external_id: &str,
        other_external_id: &str,
    ) -> Result<()> {
        let (agent_ext, other_ext) = clean_endpoint_pair(agent_external_id, other_external_id)?;
        let agent = self.agent(&agent_ext).await?;
        let other = self.agent(&other_ext).await?;

        let session = self
            .store
            .active_session_between(agent.id, other.id)
            .await?
            .ok_or_else(|| {
                Error::SessionState(format!(
                    "no active conversation between {agent_ext} and {other_ext}"
                ))
            })?;

        self.store.end_session(session.id).await?;

        let ending = json!({ "type": "conversation_ended", "reason": "explicit_end" });
        for (from, to) in [(&agent, &other), (&other, &agent)] {
            let message_id = self
                .store
                .insert_message(NewMessage {
                    sender_id: Some(from.id),
                    recipient_id: Some(to.id),
                    session_id: Some(session.id),
                    meeting_id: None,
                    message_type: MessageType::System,
                    content: ending.clone(),
                    metadata: json!({}),
                })
                .await?;
            let context = self
                .context(
                    from,
                    to,
                    HandlerKind::Conversation,
                    message_id,
                    Some(session.id),
                    json!({}),
                )
                .await?;
            self.registry
                .invoke_detached(HandlerKind::Conversation, ending.clone(), context);
        }

        // Unpark anyone still waiting on this session; they re-check the
        // queue and see the ending message.
        self.waiters.try_wake(session.id, agent.id, None);
        self.waiters.try_wake(session.id, other.id, None);

        info!(session_id = %session.id, "conversation ended");
        Ok(())
    }

    /// Drain the unread queue for an agent, marking everything read.
    pub async fn get_unread_messages(&self, agent_external_id: &str) -> Result<Vec<Value>> {
        let agent_ext = clean_external_id(agent_external_id, "agent external id")?;
        let agent = self.agent(&agent_ext).await?;
        let messages = self.store.unread_for_recipient(agent.id).await?;
        let mut contents = Vec::with_capacity(messages.len());
        for message in messages {
            self.store.mark_read(message.id).await?;
            contents.push(message.content);
        }
        Ok(contents)
    }

    /// Active sessions for an agent with peers and lock holders resolved.
    pub async fn active_sessions(&self, agent_external_id: &str) -> Result<Vec<SessionOverview>> {
        let agent_ext = clean_external_id(agent_external_id, "agent external id")?;
        let agent = self.agent(&agent_ext).await?;
        self.store.session_overviews(agent.id).await
    }

    /// Full replay of a session in insertion order.
    pub async fn session_history(&self, session_id: Uuid) -> Result<Vec<crate::model::Message>> {
        self.store.messages_for_session(session_id).await
    }

    /// One filtered page of a session transcript (date range, message
    /// types, row limit).
    pub async fn session_history_filtered(
        &self,
        session_id: Uuid,
        filter: &crate::store::MessageFilter,
    ) -> Result<Vec<crate::model::Message>> {
        self.store
            .messages_for_session_filtered(session_id, filter)
            .await
    }
}

#[cfg(test)]
#[path = "conversation_tests.rs"]
mod tests;
