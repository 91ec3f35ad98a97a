// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Organization;

use super::Store;

impl Store {
    /// Insert an organization. Duplicate external ids surface as
    /// [`Error::Validation`].
    pub async fn insert_organization(&self, external_id: &str, name: &str) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO organizations (external_id, name) VALUES ($1, $2) RETURNING id",
        )
        .bind(external_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if Error::is_unique_violation(&e) {
                Error::Validation(format!("organization already exists: {external_id}"))
            } else {
                Error::Persistence(e)
            }
        })?;
        Ok(id)
    }

    pub async fn organization_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT id, external_id, name, created_at, updated_at \
             FROM organizations WHERE external_id = $1",
        )
        .bind(external_id)
        .try_map(organization_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn organization_by_id(&self, id: Uuid) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT id, external_id, name, created_at, updated_at \
             FROM organizations WHERE id = $1",
        )
        .bind(id)
        .try_map(organization_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Organization owning the given agent.
    pub async fn organization_of_agent(&self, agent_id: Uuid) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT o.id, o.external_id, o.name, o.created_at, o.updated_at \
             FROM organizations o JOIN agents a ON a.organization_id = o.id \
             WHERE a.id = $1",
        )
        .bind(agent_id)
        .try_map(organization_from_row)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Delete by external id, cascading to agents, sessions, meetings, and
    /// messages. Returns false when nothing matched.
    pub async fn delete_organization(&self, external_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM organizations WHERE external_id = $1")
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }
}

fn organization_from_row(row: PgRow) -> sqlx::Result<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
