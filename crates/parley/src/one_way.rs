// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fire-and-forget delivery: persist, dispatch detached, notify idle
//! recipients. No session, no waiting.

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use std::sync::Arc;

use crate::conversation::wrap_content;
use crate::error::{Error, Result};
use crate::handler::HandlerRegistry;
use crate::model::{clean_external_id, Agent, HandlerKind, MessageContext, MessageType};
use crate::store::{NewMessage, Store};

pub struct OneWayMessenger {
    store: Store,
    registry: Arc<HandlerRegistry>,
}

impl OneWayMessenger {
    pub(crate) fn new(store: Store, registry: Arc<HandlerRegistry>) -> Self {
        Self { store, registry }
    }

    async fn agent(&self, external_id: &str) -> Result<Agent> {
        self.store
            .agent_by_external_id(external_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(external_id.to_owned()))
    }

    /// Deliver `message` to each recipient. Fails before persisting
    /// anything when no `one_way` handler is registered, so senders get
    /// synchronous feedback. Returns the persisted message ids in recipient
    /// order.
    pub async fn send(
        &self,
        sender_external_id: &str,
        recipient_external_ids: &[&str],
        message: Value,
        metadata: Option<Value>,
    ) -> Result<Vec<Uuid>> {
        let sender_ext = clean_external_id(sender_external_id, "sender external id")?;
        if recipient_external_ids.is_empty() {
            return Err(Error::Validation("recipients cannot be empty".to_owned()));
        }
        let mut recipient_exts = Vec::with_capacity(recipient_external_ids.len());
        for raw in recipient_external_ids {
            let ext = clean_external_id(raw, "recipient external id")?;
            if ext == sender_ext {
                return Err(Error::Validation(
                    "sender and recipient cannot be the same agent".to_owned(),
                ));
            }
            recipient_exts.push(ext);
        }
        if !self.registry.has(HandlerKind::OneWay) {
            return Err(Error::NoHandlerRegistered(HandlerKind::OneWay));
        }

        let sender = self.agent(&sender_ext).await?;
        let mut recipients = Vec::with_capacity(recipient_exts.len());
        for ext in &recipient_exts {
            recipients.push(self.agent(ext).await?);
        }
        let organization_id = self
            .store
            .organization_of_agent(sender.id)
            .await?
            .map(|org| org.external_id)
            .unwrap_or_else(|| "unknown".to_owned());
        let metadata = metadata.unwrap_or_else(|| json!({}));

        let content = wrap_content(message.clone());
        let mut message_ids = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let message_id = self
                .store
                .insert_message(NewMessage {
                    sender_id: Some(sender.id),
                    recipient_id: Some(recipient.id),
                    session_id: None,
                    meeting_id: None,
                    message_type: MessageType::UserDefined,
                    content: content.clone(),
                    metadata: metadata.clone(),
                })
                .await?;
            message_ids.push(message_id);

            let context = MessageContext {
                sender_id: sender.external_id.clone(),
                receiver_id: recipient.external_id.clone(),
                organization_id: organization_id.clone(),
                handler_kind: HandlerKind::OneWay,
                message_id,
                session_id: None,
                meeting_id: None,
                metadata: metadata.clone(),
            };
            self.registry
                .invoke_detached(HandlerKind::OneWay, message.clone(), context.clone());

            // Push hook, silenced while the recipient is blocked inside its
            // own send_and_wait.
            if self.registry.has(HandlerKind::Notification)
                && !self.store.is_agent_locked(recipient.id).await?
            {
                let notify_ctx = MessageContext {
                    handler_kind: HandlerKind::Notification,
                    ..context
                };
                self.registry
                    .invoke_detached(HandlerKind::Notification, json!({}), notify_ctx);
            }
        }

        info!(sender = %sender_ext, recipients = recipients.len(), "one-way message sent");
        Ok(message_ids)
    }

    /// Drain unread one-way messages for an agent, marking them read.
    pub async fn unread_for(&self, agent_external_id: &str) -> Result<Vec<Value>> {
        let agent_ext = clean_external_id(agent_external_id, "agent external id")?;
        let agent = self.agent(&agent_ext).await?;
        let messages = self.store.unread_one_way_for_recipient(agent.id).await?;
        let mut contents = Vec::with_capacity(messages.len());
        for message in messages {
            self.store.mark_read(message.id).await?;
            contents.push(message.content);
        }
        Ok(contents)
    }
}
