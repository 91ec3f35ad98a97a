// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Agent;

use super::Store;

impl Store {
    pub async fn insert_agent(
        &self,
        external_id: &str,
        organization_id: Uuid,
        name: &str,
    ) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO agents (external_id, organization_id, name) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(external_id)
        .bind(organization_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if Error::is_unique_violation(&e) {
                Error::Validation(format!("agent already exists: {external_id}"))
            } else {
                Error::Persistence(e)
            }
        })?;
        Ok(id)
    }

    pub async fn agent_by_external_id(&self, external_id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, external_id, organization_id, name, created_at, updated_at \
             FROM agents WHERE external_id = $1",
        )
        .bind(external_id)
        .try_map(agent_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn agent_by_id(&self, id: Uuid) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, external_id, organization_id, name, created_at, updated_at \
             FROM agents WHERE id = $1",
        )
        .bind(id)
        .try_map(agent_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn agents_in_organization(&self, organization_id: Uuid) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT id, external_id, organization_id, name, created_at, updated_at \
             FROM agents WHERE organization_id = $1 ORDER BY created_at",
        )
        .bind(organization_id)
        .try_map(agent_from_row)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// The §4.5/§4.6 not-locked predicate: is this agent currently the
    /// locked party of any active session?
    pub async fn is_agent_locked(&self, agent_id: Uuid) -> Result<bool> {
        let locked: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sessions \
             WHERE locked_agent_id = $1 AND status = 'ACTIVE')",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(locked)
    }

    /// Delete by external id, cascading to sessions, messages, and meeting
    /// participations. Returns false when nothing matched.
    pub async fn delete_agent(&self, external_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM agents WHERE external_id = $1")
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }
}

fn agent_from_row(row: PgRow) -> sqlx::Result<Agent> {
    Ok(Agent {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
