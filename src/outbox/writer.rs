//! Outbox writer: the producer-facing half of the outbox.

use sea_query::{PostgresQueryBuilder, Query};
use sea_query_binder::{SqlxBinder, SqlxValues};
use serde_json::Value;
use sqlx::PgExecutor;
use tracing::debug;
use uuid::Uuid;

use super::schema::Outbox;
use super::{validate_event_type, OutboxRow, Result};

/// Build the `INSERT … RETURNING *` statement for a new outbox row.
pub(crate) fn insert_statement(id: Uuid, event_type: &str, payload: Value) -> (String, SqlxValues) {
    Query::insert()
        .into_table(Outbox::Table)
        .columns([Outbox::Id, Outbox::EventType, Outbox::Payload])
        .values_panic([id.into(), event_type.into(), payload.into()])
        .returning_all()
        .build_sqlx(PostgresQueryBuilder)
}

/// Write an event to the outbox as part of the caller's transaction.
///
/// Pass the transaction that carries the business change (`&mut *tx`) so the
/// row commits or rolls back together with it. No event becomes visible to
/// consumers until the dispatcher publishes the committed row.
///
/// ```ignore
/// let mut tx = pool.begin().await?;
/// sqlx::query("INSERT INTO wallets (id) VALUES ($1)").bind(id).execute(&mut *tx).await?;
/// ferry::outbox::emit(&mut *tx, "wallet.created", json!({ "id": id })).await?;
/// tx.commit().await?;
/// ```
pub async fn emit<'e, E>(executor: E, event_type: &str, payload: Value) -> Result<OutboxRow>
where
    E: PgExecutor<'e>,
{
    validate_event_type(event_type)?;

    let (sql, values) = insert_statement(Uuid::new_v4(), event_type, payload);
    let row: OutboxRow = sqlx::query_as_with(&sql, values).fetch_one(executor).await?;

    debug!(event_id = %row.id, event_type = %row.event_type, "Event written to outbox");
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_statement_binds_values() {
        let (sql, _values) = insert_statement(Uuid::new_v4(), "wallet.created", json!({"id": "w1"}));

        assert!(sql.starts_with(r#"INSERT INTO "ferry_outbox" ("id", "event_type", "payload")"#));
        assert!(sql.contains("$1"));
        assert!(sql.contains("RETURNING"));
    }
}
