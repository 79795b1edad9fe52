//! Postgres-backed stores.
//!
//! Each table carries the key columns its unique index and queries need,
//! plus a `doc` JSONB column with the serialized domain record.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError | Scenario |
//! |------------|-----------------|------------|----------|
//! | Database (unique violation) | `23505` | handled | Duplicate key; the store returns the stored row |
//! | Database (check violation) | `23514` | `Corrupt` | Value rejected by a CHECK constraint |
//! | Database (other) | any | `Storage` | Other database errors |
//! | RowNotFound | N/A | `NotFound` | `fetch_one` found nothing |
//! | PoolClosed / Other | N/A | `Storage` | Network or pool failures |

mod billing;
mod credit;
mod finalize;
mod fx;
mod ledger;
mod locks;
mod usage;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

pub use billing::{PostgresPaymentStore, PostgresSubscriptionStore, PostgresWebhookEventStore};
pub use credit::PostgresCreditProfileStore;
pub use finalize::PostgresFinalizeStore;
pub use fx::PostgresFxStore;
pub use ledger::PostgresLedgerStore;
pub use locks::PgAgencyLocks;
pub use usage::{PostgresPlanStore, PostgresUsageStore};

use crate::store::StoreError;

const SCHEMA: &str = include_str!("../../migrations/0001_ledger_billing.sql");

/// Open a pool against `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Create the schema if it does not exist yet. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    info!("schema ready");
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {operation}")),
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// SQLSTATE 23505.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

pub(crate) fn to_doc<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(format!("failed to encode row: {e}")))
}

pub(crate) fn from_doc<T: DeserializeOwned>(doc: JsonValue) -> Result<T, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::Corrupt(format!("failed to decode row: {e}")))
}

/// Decode the `doc` column of `row`.
pub(crate) fn doc_of<T: DeserializeOwned>(row: &PgRow) -> Result<T, StoreError> {
    let doc: JsonValue = row
        .try_get("doc")
        .map_err(|e| StoreError::Corrupt(format!("missing doc column: {e}")))?;
    from_doc(doc)
}

/// `u64` counters are stored as BIGINT.
pub(crate) fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} out of range: {value}")))
}

pub(crate) fn to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_map_to_storage() {
        assert!(matches!(map_sqlx_error("op", sqlx::Error::PoolClosed), StoreError::Storage(_)));
        assert!(matches!(map_sqlx_error("op", sqlx::Error::RowNotFound), StoreError::NotFound(_)));
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn negative_counters_are_corrupt() {
        assert!(to_u64(-1, "entry_count").is_err());
        assert_eq!(to_i64(7, "quantity").unwrap(), 7);
    }

    #[test]
    fn schema_declares_every_idempotency_key() {
        for needle in [
            "UNIQUE (org_id, code)",
            "UNIQUE (org_id, source_type, source_id, event)",
            "PRIMARY KEY (org_id, context_type, context_id, base, quote)",
            "PRIMARY KEY (tenant_id, metric, source_event_id)",
            "PRIMARY KEY (provider, event_id)",
            "period       TEXT        PRIMARY KEY",
        ] {
            assert!(SCHEMA.contains(needle), "missing: {needle}");
        }
    }
}
