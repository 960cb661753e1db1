//! Outbox table schema using sea-query.

use sea_query::{ColumnDef, Expr, Iden, Index, PostgresQueryBuilder, Table};

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    #[iden = "ferry_outbox"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "published_at"]
    PublishedAt,
}

/// Partial index backing the claim query. sea-query cannot express the
/// `WHERE` clause on index creation.
pub const CREATE_UNPUBLISHED_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_ferry_outbox_unpublished \
     ON ferry_outbox (created_at) WHERE published_at IS NULL";

/// DDL statements creating the outbox table and its indexes, in order.
pub fn create_statements() -> Vec<String> {
    let table = Table::create()
        .table(Outbox::Table)
        .if_not_exists()
        .col(ColumnDef::new(Outbox::Id).uuid().primary_key())
        .col(ColumnDef::new(Outbox::EventType).text().not_null())
        .col(ColumnDef::new(Outbox::Payload).json_binary().not_null())
        .col(
            ColumnDef::new(Outbox::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(ColumnDef::new(Outbox::PublishedAt).timestamp_with_time_zone().null())
        .to_string(PostgresQueryBuilder);

    // Retention sweep
    let published_index = Index::create()
        .if_not_exists()
        .name("idx_ferry_outbox_published_at")
        .table(Outbox::Table)
        .col(Outbox::PublishedAt)
        .to_string(PostgresQueryBuilder);

    vec![table, CREATE_UNPUBLISHED_INDEX.to_string(), published_index]
}
