// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Message, MessageType};

use super::{decode_err, Store};

/// Insert shape for a message row. Exactly one routing shape should hold;
/// the engines construct these, never callers.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub meeting_id: Option<Uuid>,
    pub message_type: MessageType,
    pub content: Value,
    pub metadata: Value,
}

/// Filters for a transcript page. Dates are inclusive; an empty type list
/// matches every message type.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub message_types: Vec<MessageType>,
    pub limit: i64,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            date_from: None,
            date_to: None,
            message_types: Vec::new(),
            limit: 100,
        }
    }
}

/// One predicate over the `metadata` document.
#[derive(Debug, Clone)]
pub enum MetadataMatch {
    /// The key's value equals this one (compared in text form).
    Equals { key: String, value: Value },
    /// The key holds an array containing this value.
    Contains { key: String, value: Value },
    /// The key is present (or absent, with `present = false`).
    Exists { key: String, present: bool },
}

impl MetadataMatch {
    pub fn equals(key: impl Into<String>, value: Value) -> Self {
        Self::Equals {
            key: key.into(),
            value,
        }
    }

    pub fn contains(key: impl Into<String>, value: Value) -> Self {
        Self::Contains {
            key: key.into(),
            value,
        }
    }

    pub fn exists(key: impl Into<String>, present: bool) -> Self {
        Self::Exists {
            key: key.into(),
            present,
        }
    }
}

/// A metadata query: every predicate must hold, optionally scoped to a
/// sender, recipient, session, or meeting. Results come newest first with
/// `limit`/`offset` pagination.
#[derive(Debug, Clone)]
pub struct MetadataQuery {
    pub filters: Vec<MetadataMatch>,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub meeting_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for MetadataQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sender_id: None,
            recipient_id: None,
            session_id: None,
            meeting_id: None,
            limit: 100,
            offset: 0,
        }
    }
}

const MESSAGE_COLUMNS: &str = "id, sender_id, recipient_id, session_id, meeting_id, \
                               message_type, content, metadata, read_at, created_at";

impl Store {
    pub async fn insert_message(&self, new: NewMessage) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO messages \
             (sender_id, recipient_id, session_id, meeting_id, message_type, content, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(new.sender_id)
        .bind(new.recipient_id)
        .bind(new.session_id)
        .bind(new.meeting_id)
        .bind(new.message_type.as_str())
        .bind(new.content)
        .bind(new.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn message_by_id(&self, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(message_id)
        .try_map(message_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_read(&self, message_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE messages SET read_at = clock_timestamp() WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All unread messages addressed to an agent, oldest first.
    pub async fn unread_for_recipient(&self, recipient_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE recipient_id = $1 AND read_at IS NULL ORDER BY created_at"
        ))
        .bind(recipient_id)
        .try_map(message_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Unread one-way messages for an agent (no session, no meeting).
    pub async fn unread_one_way_for_recipient(&self, recipient_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE recipient_id = $1 AND read_at IS NULL \
               AND session_id IS NULL AND meeting_id IS NULL \
             ORDER BY created_at"
        ))
        .bind(recipient_id)
        .try_map(message_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Oldest unread message from a specific counterpart, if any.
    pub async fn first_unread_from(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE recipient_id = $1 AND sender_id = $2 AND read_at IS NULL \
             ORDER BY created_at LIMIT 1"
        ))
        .bind(recipient_id)
        .bind(sender_id)
        .try_map(message_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Canonical replay order for a session.
    pub async fn messages_for_session(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE session_id = $1 ORDER BY created_at"
        ))
        .bind(session_id)
        .try_map(message_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Canonical replay order for a meeting.
    pub async fn messages_for_meeting(&self, meeting_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE meeting_id = $1 ORDER BY created_at"
        ))
        .bind(meeting_id)
        .try_map(message_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// One filtered page of a session transcript, oldest first.
    pub async fn messages_for_session_filtered(
        &self,
        session_id: Uuid,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>> {
        self.transcript_page("session_id", session_id, filter).await
    }

    /// One filtered page of a meeting transcript, oldest first.
    pub async fn messages_for_meeting_filtered(
        &self,
        meeting_id: Uuid,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>> {
        self.transcript_page("meeting_id", meeting_id, filter).await
    }

    /// `column` is one of our own identifiers, never caller input.
    async fn transcript_page(
        &self,
        column: &str,
        id: Uuid,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE "));
        builder.push(column);
        builder.push(" = ");
        builder.push_bind(id);
        if let Some(from) = filter.date_from {
            builder.push(" AND created_at >= ");
            builder.push_bind(from);
        }
        if let Some(to) = filter.date_to {
            builder.push(" AND created_at <= ");
            builder.push_bind(to);
        }
        if !filter.message_types.is_empty() {
            builder.push(" AND message_type IN (");
            let mut types = builder.separated(", ");
            for message_type in &filter.message_types {
                types.push_bind(message_type.as_str());
            }
            builder.push(")");
        }
        builder.push(" ORDER BY created_at LIMIT ");
        builder.push_bind(filter.limit);
        let rows = builder
            .build()
            .try_map(message_from_row)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Query messages by metadata predicates, newest first. See
    /// [`MetadataQuery`] for scoping and pagination.
    pub async fn messages_by_metadata(&self, query: &MetadataQuery) -> Result<Vec<Message>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE TRUE"));
        for predicate in &query.filters {
            match predicate {
                MetadataMatch::Equals { key, value } => {
                    builder.push(" AND metadata->>");
                    builder.push_bind(key.clone());
                    builder.push(" = ");
                    builder.push_bind(match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    });
                }
                MetadataMatch::Contains { key, value } => {
                    builder.push(" AND metadata->");
                    builder.push_bind(key.clone());
                    builder.push(" @> ");
                    builder.push_bind(Value::Array(vec![value.clone()]));
                }
                MetadataMatch::Exists { key, present } => {
                    if *present {
                        builder.push(" AND jsonb_exists(metadata, ");
                    } else {
                        builder.push(" AND NOT jsonb_exists(metadata, ");
                    }
                    builder.push_bind(key.clone());
                    builder.push(")");
                }
            }
        }
        if let Some(sender_id) = query.sender_id {
            builder.push(" AND sender_id = ");
            builder.push_bind(sender_id);
        }
        if let Some(recipient_id) = query.recipient_id {
            builder.push(" AND recipient_id = ");
            builder.push_bind(recipient_id);
        }
        if let Some(session_id) = query.session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session_id);
        }
        if let Some(meeting_id) = query.meeting_id {
            builder.push(" AND meeting_id = ");
            builder.push_bind(meeting_id);
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(query.limit);
        builder.push(" OFFSET ");
        builder.push_bind(query.offset);
        let rows = builder
            .build()
            .try_map(message_from_row)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Meeting messages persisted at or after `since`, optionally excluding
    /// one message id (the caller's own). Used by wait-for-turn parking.
    pub async fn meeting_messages_since(
        &self,
        meeting_id: Uuid,
        since: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE meeting_id = $1 AND created_at >= $2 AND ($3::uuid IS NULL OR id <> $3) \
             ORDER BY created_at"
        ))
        .bind(meeting_id)
        .bind(since)
        .bind(exclude)
        .try_map(message_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn message_from_row(row: PgRow) -> sqlx::Result<Message> {
    let message_type: String = row.try_get("message_type")?;
    Ok(Message {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        recipient_id: row.try_get("recipient_id")?,
        session_id: row.try_get("session_id")?,
        meeting_id: row.try_get("meeting_id")?,
        message_type: MessageType::parse(&message_type)
            .ok_or_else(|| decode_err(format!("unknown message type {message_type}")))?,
        content: row.try_get("content")?,
        metadata: row.try_get("metadata")?,
        read_at: row.try_get("read_at")?,
        created_at: row.try_get("created_at")?,
    })
}
