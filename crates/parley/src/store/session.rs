// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Session, SessionOverview, SessionStatus};

use super::{decode_err, Store};

/// Canonicalize a pair so lookups are order-independent.
fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

const SESSION_COLUMNS: &str = "id, agent_a_id, agent_b_id, status, locked_agent_id, \
                               created_at, updated_at, ended_at";

impl Store {
    pub async fn session_by_id(&self, session_id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(session_id)
        .try_map(session_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn active_session_between(&self, a: Uuid, b: Uuid) -> Result<Option<Session>> {
        let (a, b) = canonical_pair(a, b);
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE agent_a_id = $1 AND agent_b_id = $2 AND status = 'ACTIVE'"
        ))
        .bind(a)
        .bind(b)
        .try_map(session_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Look up the active session for a pair, creating it lazily on first
    /// contact. Loses gracefully against a concurrent creator: the partial
    /// unique index makes the insert a no-op, and the re-read picks up the
    /// winner's row.
    pub async fn get_or_create_active_session(&self, a: Uuid, b: Uuid) -> Result<Session> {
        if let Some(session) = self.active_session_between(a, b).await? {
            return Ok(session);
        }
        let (a, b) = canonical_pair(a, b);
        let inserted = sqlx::query(&format!(
            "INSERT INTO sessions (agent_a_id, agent_b_id, status) \
             VALUES ($1, $2, 'ACTIVE') \
             ON CONFLICT (agent_a_id, agent_b_id) WHERE status = 'ACTIVE' DO NOTHING \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(a)
        .bind(b)
        .try_map(session_from_row)
        .fetch_optional(&self.pool)
        .await?;
        match inserted {
            Some(session) => Ok(session),
            None => {
                let session = self.active_session_between(a, b).await?;
                session.ok_or_else(|| {
                    decode_err(format!("active session for ({a}, {b}) vanished after insert"))
                        .into()
                })
            }
        }
    }

    /// Set or clear the blocking-send holder for a session.
    pub async fn set_locked_agent(&self, session_id: Uuid, agent_id: Option<Uuid>) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET locked_agent_id = $1, updated_at = clock_timestamp() \
             WHERE id = $2",
        )
        .bind(agent_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn end_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = 'ENDED', ended_at = clock_timestamp(), \
             updated_at = clock_timestamp() WHERE id = $1",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sessions_for_agent(&self, agent_id: Uuid) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE agent_a_id = $1 OR agent_b_id = $1 ORDER BY created_at DESC"
        ))
        .bind(agent_id)
        .try_map(session_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active sessions for an agent with the peer and lock holder resolved.
    pub async fn session_overviews(&self, agent_id: Uuid) -> Result<Vec<SessionOverview>> {
        let rows = sqlx::query(
            "SELECT s.id AS session_id, s.status, s.created_at, \
                    peer.external_id AS peer_external_id, peer.name AS peer_name, \
                    holder.external_id AS locked_by \
             FROM sessions s \
             JOIN agents peer \
               ON peer.id = CASE WHEN s.agent_a_id = $1 THEN s.agent_b_id ELSE s.agent_a_id END \
             LEFT JOIN agents holder ON holder.id = s.locked_agent_id \
             WHERE (s.agent_a_id = $1 OR s.agent_b_id = $1) AND s.status = 'ACTIVE' \
             ORDER BY s.created_at DESC",
        )
        .bind(agent_id)
        .try_map(|row: PgRow| {
            let status: String = row.try_get("status")?;
            Ok(SessionOverview {
                session_id: row.try_get("session_id")?,
                peer_external_id: row.try_get("peer_external_id")?,
                peer_name: row.try_get("peer_name")?,
                status: SessionStatus::parse(&status)
                    .ok_or_else(|| decode_err(format!("unknown session status {status}")))?,
                created_at: row.try_get("created_at")?,
                locked_by: row.try_get("locked_by")?,
            })
        })
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn session_from_row(row: PgRow) -> sqlx::Result<Session> {
    let status: String = row.try_get("status")?;
    Ok(Session {
        id: row.try_get("id")?,
        agent_a_id: row.try_get("agent_a_id")?,
        agent_b_id: row.try_get("agent_b_id")?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown session status {status}")))?,
        locked_agent_id: row.try_get("locked_agent_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}
