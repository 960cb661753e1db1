//! PostgreSQL outbox store.
//!
//! Claiming uses `SELECT … FOR UPDATE SKIP LOCKED` inside a transaction that
//! stays open for the life of the [`ClaimedBatch`]. A second dispatcher
//! running the same query concurrently gets the next unlocked rows instead of
//! waiting, so two instances never hold the same row in one cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{
    Expr, LockBehavior, LockType, Order, PostgresQueryBuilder, Query, SelectStatement,
};
use sea_query_binder::SqlxBinder;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::schema::{create_statements, Outbox};
use super::writer::insert_statement;
use super::{validate_event_type, ClaimedBatch, OutboxError, OutboxRow, OutboxStore, Result};

/// PostgreSQL implementation of [`OutboxStore`].
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new PostgreSQL outbox store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool with at most `max_connections` connections.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Underlying pool, for producers that open their own transactions.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize the outbox table schema.
    pub async fn init(&self) -> Result<()> {
        for statement in create_statements() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        info!("Outbox table initialized (PostgreSQL)");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn insert(&self, event_type: &str, payload: Value) -> Result<OutboxRow> {
        validate_event_type(event_type)?;

        let (sql, values) = insert_statement(Uuid::new_v4(), event_type, payload);
        let row: OutboxRow = sqlx::query_as_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn claim(&self, limit: u32) -> Result<Box<dyn ClaimedBatch>> {
        let mut tx = self.pool.begin().await?;

        let (sql, values) = claim_query(limit).build_sqlx(PostgresQueryBuilder);

        let rows: Vec<OutboxRow> = sqlx::query_as_with(&sql, values)
            .fetch_all(&mut *tx)
            .await?;

        if !rows.is_empty() {
            debug!(claimed = rows.len(), "Claimed outbox rows");
        }

        Ok(Box::new(PostgresClaimedBatch { tx, rows }))
    }

    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let (sql, values) = Query::delete()
            .from_table(Outbox::Table)
            .and_where(Expr::col(Outbox::PublishedAt).is_not_null())
            .and_where(Expr::col(Outbox::PublishedAt).lt(cutoff))
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// Oldest unpublished rows, skipping rows locked by other transactions.
fn claim_query(limit: u32) -> SelectStatement {
    Query::select()
        .columns([
            Outbox::Id,
            Outbox::EventType,
            Outbox::Payload,
            Outbox::CreatedAt,
            Outbox::PublishedAt,
        ])
        .from(Outbox::Table)
        .and_where(Expr::col(Outbox::PublishedAt).is_null())
        .order_by(Outbox::CreatedAt, Order::Asc)
        .limit(u64::from(limit))
        .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
        .to_owned()
}

/// Rows claimed inside an open PostgreSQL transaction.
///
/// Dropping the batch drops the transaction, which sqlx rolls back.
struct PostgresClaimedBatch {
    tx: Transaction<'static, Postgres>,
    rows: Vec<OutboxRow>,
}

#[async_trait]
impl ClaimedBatch for PostgresClaimedBatch {
    fn rows(&self) -> &[OutboxRow] {
        &self.rows
    }

    async fn mark_published(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if !self.rows.iter().any(|row| row.id == id) {
            return Err(OutboxError::NotClaimed(id));
        }

        let (sql, values) = Query::update()
            .table(Outbox::Table)
            .value(Outbox::PublishedAt, at)
            .and_where(Expr::col(Outbox::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
