// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence adapters: narrow CRUD over the seven coordinator tables.
//!
//! All SQL lives under this module; the coordinator engines never build
//! queries themselves. [`Store`] is a cheap clone over the shared pool.
//! Per-entity operations are split across sibling files as separate
//! `impl Store` blocks.

mod agent;
mod event;
mod meeting;
mod message;
mod org;
mod session;

pub use message::{MessageFilter, MetadataMatch, MetadataQuery, NewMessage};

use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use tracing::info;

use crate::config::Config;
use crate::error::Result;

/// One idempotent bootstrap, per the no-migrations policy.
const SCHEMA: &str = include_str!("schema.sql");

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Open the pool described by `config`. Does not touch the schema.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .min_connections(config.pool_min)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.database_url)
            .await?;
        info!(max = config.pool_max, min = config.pool_min, "connected to store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, embedding hosts with their own pool).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bootstrap schema. Safe to run on every startup.
    pub async fn bootstrap(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("store schema bootstrapped");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pin a dedicated connection, for advisory-lock critical sections.
    pub async fn pin(&self) -> Result<PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// Build a decode error for a value the schema should have prevented.
pub(crate) fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}
