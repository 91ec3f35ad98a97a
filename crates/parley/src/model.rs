// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core entities and wire-level enums for the coordination store.
//!
//! Status enums are persisted as uppercase text and round-trip through
//! `as_str`/`parse`. Message bodies and metadata are opaque JSON documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A tenant grouping of agents. Deleting an organization cascades to its
/// agents and everything they own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named messaging endpoint within an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub external_id: String,
    pub organization_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pairwise conversation container. The agent pair is stored in canonical
/// (sorted) order so `(agent_a_id, agent_b_id)` identifies the active
/// session between any two agents regardless of who spoke first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub agent_a_id: Uuid,
    pub agent_b_id: Uuid,
    pub status: SessionStatus,
    /// Non-null only while a blocking `send_and_wait` holds this session.
    pub locked_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Waiting,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Waiting => "WAITING",
            Self::Ended => "ENDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "WAITING" => Some(Self::Waiting),
            "ENDED" => Some(Self::Ended),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// N-party turn-based conversation with a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub host_id: Uuid,
    pub status: MeetingStatus,
    pub current_speaker_id: Option<Uuid>,
    /// Turn duration in seconds. `None` disables turn timeouts.
    pub turn_duration_secs: Option<f64>,
    pub turn_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Meeting {
    /// Turn duration as a [`std::time::Duration`], when timeouts are enabled.
    pub fn turn_duration(&self) -> Option<std::time::Duration> {
        self.turn_duration_secs
            .filter(|secs| *secs > 0.0)
            .map(std::time::Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeetingStatus {
    Created,
    /// Reserved for a future "all attended, not yet started" phase. No
    /// transition currently produces it.
    Ready,
    Active,
    Ended,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Ready => "READY",
            Self::Active => "ACTIVE",
            Self::Ended => "ENDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(Self::Created),
            "READY" => Some(Self::Ready),
            "ACTIVE" => Some(Self::Active),
            "ENDED" => Some(Self::Ended),
            _ => None,
        }
    }
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent's membership record in a meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingParticipant {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub agent_id: Uuid,
    pub status: ParticipantStatus,
    /// Dense, stable ordering assigned at creation; drives round-robin.
    pub join_order: i32,
    pub is_locked: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Invited,
    Attending,
    Waiting,
    Speaking,
    /// Terminal.
    Left,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invited => "INVITED",
            Self::Attending => "ATTENDING",
            Self::Waiting => "WAITING",
            Self::Speaking => "SPEAKING",
            Self::Left => "LEFT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INVITED" => Some(Self::Invited),
            "ATTENDING" => Some(Self::Attending),
            "WAITING" => Some(Self::Waiting),
            "SPEAKING" => Some(Self::Speaking),
            "LEFT" => Some(Self::Left),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message. Exactly one of the routing shapes holds:
/// one-way (`recipient_id` set, `session_id` null), conversation
/// (`session_id` set), or meeting (`meeting_id` set, `recipient_id` null).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Null only for system-generated turn-timeout messages.
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub meeting_id: Option<Uuid>,
    pub message_type: MessageType,
    pub content: Value,
    pub metadata: Value,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    UserDefined,
    System,
    Timeout,
    Ending,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserDefined => "USER_DEFINED",
            Self::System => "SYSTEM",
            Self::Timeout => "TIMEOUT",
            Self::Ending => "ENDING",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "USER_DEFINED" => Some(Self::UserDefined),
            "SYSTEM" => Some(Self::System),
            "TIMEOUT" => Some(Self::Timeout),
            "ENDING" => Some(Self::Ending),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of user callback a message is dispatched to. One global slot
/// per kind; the callback itself dispatches on the [`MessageContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    OneWay,
    Conversation,
    Meeting,
    System,
    Notification,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneWay => "one_way",
            Self::Conversation => "conversation",
            Self::Meeting => "meeting",
            Self::System => "system",
            Self::Notification => "notification",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing context handed to user handlers alongside the message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    pub sender_id: String,
    pub receiver_id: String,
    pub organization_id: String,
    pub handler_kind: HandlerKind,
    pub message_id: Uuid,
    pub session_id: Option<Uuid>,
    pub meeting_id: Option<Uuid>,
    pub metadata: Value,
}

/// Append-only audit record mirroring a meeting lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingEventRecord {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub event_type: String,
    pub agent_id: Option<Uuid>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Summary of an active session from one agent's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOverview {
    pub session_id: Uuid,
    pub peer_external_id: String,
    pub peer_name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub locked_by: Option<String>,
}

/// Validate and trim a caller-supplied external id.
pub(crate) fn clean_external_id(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!(
            "{field} cannot be empty or whitespace"
        )));
    }
    Ok(trimmed.to_owned())
}

/// Validate a sender/recipient pair: both non-empty and distinct.
pub(crate) fn clean_endpoint_pair(sender: &str, recipient: &str) -> Result<(String, String)> {
    let sender = clean_external_id(sender, "sender external id")?;
    let recipient = clean_external_id(recipient, "recipient external id")?;
    if sender == recipient {
        return Err(Error::Validation(
            "sender and recipient cannot be the same agent".to_owned(),
        ));
    }
    Ok((sender, recipient))
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
