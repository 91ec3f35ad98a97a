// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Meeting, MeetingParticipant, MeetingStatus, ParticipantStatus};

use super::{decode_err, Store};

const MEETING_COLUMNS: &str = "id, host_id, status, current_speaker_id, turn_duration, \
                               turn_started_at, created_at, started_at, ended_at";

const PARTICIPANT_COLUMNS: &str = "id, meeting_id, agent_id, status, join_order, is_locked, \
                                   joined_at, left_at";

impl Store {
    pub async fn insert_meeting(&self, host_id: Uuid, turn_duration: Option<f64>) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO meetings (host_id, status, turn_duration) \
             VALUES ($1, 'CREATED', $2) RETURNING id",
        )
        .bind(host_id)
        .bind(turn_duration)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn meeting_by_id(&self, meeting_id: Uuid) -> Result<Option<Meeting>> {
        let row = sqlx::query(&format!(
            "SELECT {MEETING_COLUMNS} FROM meetings WHERE id = $1"
        ))
        .bind(meeting_id)
        .try_map(meeting_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn start_meeting(&self, meeting_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE meetings SET status = 'ACTIVE', started_at = clock_timestamp() \
             WHERE id = $1",
        )
        .bind(meeting_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition; clears the speaker to keep the
    /// speaker-iff-active invariant.
    pub async fn end_meeting(&self, meeting_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE meetings SET status = 'ENDED', ended_at = clock_timestamp(), \
             current_speaker_id = NULL, turn_started_at = NULL WHERE id = $1",
        )
        .bind(meeting_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hand the turn to `agent_id`, or clear the speaker entirely when no
    /// attending participant remains.
    pub async fn set_current_speaker(
        &self,
        meeting_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE meetings SET current_speaker_id = $1, \
             turn_started_at = CASE WHEN $1::uuid IS NULL THEN NULL ELSE clock_timestamp() END \
             WHERE id = $2",
        )
        .bind(agent_id)
        .bind(meeting_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_participant(
        &self,
        meeting_id: Uuid,
        agent_id: Uuid,
        join_order: i32,
    ) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO meeting_participants (meeting_id, agent_id, status, join_order) \
             VALUES ($1, $2, 'INVITED', $3) RETURNING id",
        )
        .bind(meeting_id)
        .bind(agent_id)
        .bind(join_order)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn participant(
        &self,
        meeting_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<MeetingParticipant>> {
        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM meeting_participants \
             WHERE meeting_id = $1 AND agent_id = $2"
        ))
        .bind(meeting_id)
        .bind(agent_id)
        .try_map(participant_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All participants ordered by join order (round-robin order).
    pub async fn participants(&self, meeting_id: Uuid) -> Result<Vec<MeetingParticipant>> {
        let rows = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM meeting_participants \
             WHERE meeting_id = $1 ORDER BY join_order"
        ))
        .bind(meeting_id)
        .try_map(participant_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Update a participant's attendance status, stamping joined_at/left_at
    /// on the corresponding transitions.
    pub async fn set_participant_status(
        &self,
        participant_id: Uuid,
        status: ParticipantStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE meeting_participants SET status = $1, \
             joined_at = CASE WHEN $1 = 'ATTENDING' AND joined_at IS NULL \
                              THEN clock_timestamp() ELSE joined_at END, \
             left_at = CASE WHEN $1 = 'LEFT' THEN clock_timestamp() ELSE left_at END \
             WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(participant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn meeting_from_row(row: PgRow) -> sqlx::Result<Meeting> {
    let status: String = row.try_get("status")?;
    Ok(Meeting {
        id: row.try_get("id")?,
        host_id: row.try_get("host_id")?,
        status: MeetingStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown meeting status {status}")))?,
        current_speaker_id: row.try_get("current_speaker_id")?,
        turn_duration_secs: row.try_get("turn_duration")?,
        turn_started_at: row.try_get("turn_started_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn participant_from_row(row: PgRow) -> sqlx::Result<MeetingParticipant> {
    let status: String = row.try_get("status")?;
    Ok(MeetingParticipant {
        id: row.try_get("id")?,
        meeting_id: row.try_get("meeting_id")?,
        agent_id: row.try_get("agent_id")?,
        status: ParticipantStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown participant status {status}")))?,
        join_order: row.try_get("join_order")?,
        is_locked: row.try_get("is_locked")?,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
    })
}
