// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;
use crate::model::MeetingEventRecord;

use super::Store;

impl Store {
    /// Append an audit row for a meeting lifecycle event. Written alongside
    /// the state change it mirrors, inside the same critical section.
    pub async fn insert_meeting_event(
        &self,
        meeting_id: Uuid,
        event_type: &str,
        agent_id: Option<Uuid>,
        data: Value,
    ) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO meeting_events (meeting_id, event_type, agent_id, data) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(meeting_id)
        .bind(event_type)
        .bind(agent_id)
        .bind(data)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn events_for_meeting(&self, meeting_id: Uuid) -> Result<Vec<MeetingEventRecord>> {
        let rows = sqlx::query(
            "SELECT id, meeting_id, event_type, agent_id, data, created_at \
             FROM meeting_events WHERE meeting_id = $1 ORDER BY created_at",
        )
        .bind(meeting_id)
        .try_map(|row: PgRow| {
            Ok(MeetingEventRecord {
                id: row.try_get("id")?,
                meeting_id: row.try_get("meeting_id")?,
                event_type: row.try_get("event_type")?,
                agent_id: row.try_get("agent_id")?,
                data: row.try_get("data")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
