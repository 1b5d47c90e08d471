//! Postgres connection pool, schema and error classification.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::instrument;

use crate::config::InfraConfig;

/// Tables used by the Postgres adapters.
///
/// - `events`: order streams (append-only)
/// - `products` / `stock_reservations`: inventory rows, mutated under row locks
/// - `processed_events`: idempotency ledger, `event_id` is the dedup key
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (aggregate_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS products (
    product_id UUID PRIMARY KEY,
    name       TEXT NOT NULL,
    on_hand    BIGINT NOT NULL CHECK (on_hand >= 0),
    version    BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS stock_reservations (
    id             UUID PRIMARY KEY,
    order_id       UUID NOT NULL,
    product_id     UUID NOT NULL,
    product_name   TEXT NOT NULL,
    quantity       BIGINT NOT NULL CHECK (quantity > 0),
    status         TEXT NOT NULL CHECK (status IN ('Reserved', 'Debited', 'Released')),
    created_at     TIMESTAMPTZ NOT NULL,
    processed_at   TIMESTAMPTZ,
    correlation_id TEXT,
    release_reason TEXT,
    UNIQUE (order_id, product_id)
);

CREATE INDEX IF NOT EXISTS stock_reservations_active_idx
    ON stock_reservations (created_at) WHERE status = 'Reserved';

CREATE TABLE IF NOT EXISTS processed_events (
    id             UUID PRIMARY KEY,
    event_id       UUID NOT NULL UNIQUE,
    event_type     TEXT NOT NULL,
    order_id       UUID,
    processed_at   TIMESTAMPTZ NOT NULL,
    correlation_id TEXT,
    detail         TEXT
);
"#;

/// Open a pool sized from configuration.
#[instrument(skip(config), err)]
pub async fn connect(config: &InfraConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
}

/// Create missing tables and indexes (idempotent).
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.to_string()),
        _ => None,
    }
}

/// Unique constraint violation (`23505`).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

/// Unique violation on a specific constraint.
pub(crate) fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            is_unique_violation(err) && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

/// Errors that may succeed on retry: connectivity, pool exhaustion,
/// serialization failures (`40001`) and deadlocks (`40P01`).
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(_) => {
            matches!(sqlstate(err).as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(table: &str, name: &str) -> &'static str {
        let start = SCHEMA
            .find(&format!("CREATE TABLE IF NOT EXISTS {table} ("))
            .unwrap_or_else(|| panic!("no table {table}"));
        SCHEMA[start..]
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with(name))
            .unwrap_or_else(|| panic!("no column {table}.{name}"))
    }

    #[test]
    fn reservation_quantities_must_be_positive() {
        assert!(column("stock_reservations", "quantity").ends_with("CHECK (quantity > 0),"));
        assert!(column("products", "on_hand").contains("CHECK (on_hand >= 0)"));
    }

    #[test]
    fn ledger_dedups_on_event_id() {
        assert!(column("processed_events", "event_id").contains("UNIQUE"));
    }
}
