//! Schema probes over the legacy tables.
//!
//! Probes never return errors: SQL failures are logged and reported as
//! `false`, and the caller decides whether the stage can continue.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use tracing::{info, warn};

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// A column added on demand to a legacy table.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub definition: &'static str,
}

pub const LEGACY_BOOKKEEPING: &[ColumnSpec] = &[
    ColumnSpec {
        name: "import_status",
        definition: "INTEGER NOT NULL DEFAULT 0",
    },
    ColumnSpec {
        name: "old_activity_id",
        definition: "INTEGER",
    },
    ColumnSpec {
        name: "new_activity_id",
        definition: "INTEGER",
    },
    ColumnSpec {
        name: "favorites",
        definition: "INTEGER NOT NULL DEFAULT 0",
    },
];

fn valid_ident(name: &str) -> bool {
    IDENT_RE.is_match(name)
}

pub async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
    if !valid_ident(name) {
        warn!(target: "mediashift", event = "probe_invalid_identifier", name = %name);
        return false;
    }
    let found: Result<Option<i64>, sqlx::Error> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(name)
            .fetch_optional(pool)
            .await;
    match found {
        Ok(row) => row.is_some(),
        Err(err) => {
            warn!(target: "mediashift", event = "probe_table_failed", table = %name, error = %err);
            false
        }
    }
}

pub async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> bool {
    if !valid_ident(table) || !valid_ident(column) {
        warn!(
            target: "mediashift",
            event = "probe_invalid_identifier",
            table = %table,
            column = %column
        );
        return false;
    }
    let found: Result<Option<i64>, sqlx::Error> =
        sqlx::query_scalar("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")
            .bind(table)
            .bind(column)
            .fetch_optional(pool)
            .await;
    match found {
        Ok(row) => row.is_some(),
        Err(err) => {
            warn!(
                target: "mediashift",
                event = "probe_column_failed",
                table = %table,
                column = %column,
                error = %err
            );
            false
        }
    }
}

/// Adds whichever of `columns` are missing from `table`. Returns `true` when
/// every column is present afterwards.
pub async fn ensure_columns(pool: &SqlitePool, table: &str, columns: &[ColumnSpec]) -> bool {
    if !table_exists(pool, table).await {
        return false;
    }
    for column in columns {
        if column_exists(pool, table, column.name).await {
            continue;
        }
        if !valid_ident(column.name) {
            return false;
        }
        let sql = format!(
            "ALTER TABLE {table} ADD COLUMN {} {}",
            column.name, column.definition
        );
        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => {
                info!(
                    target: "mediashift",
                    event = "probe_column_added",
                    table = %table,
                    column = %column.name
                );
            }
            Err(err) => {
                // A concurrent add wins the race; accept it if the column is there now.
                if column_exists(pool, table, column.name).await {
                    continue;
                }
                warn!(
                    target: "mediashift",
                    event = "probe_column_add_failed",
                    table = %table,
                    column = %column.name,
                    error = %err
                );
                return false;
            }
        }
    }
    true
}

pub async fn ensure_legacy_bookkeeping(pool: &SqlitePool) -> bool {
    ensure_columns(pool, "legacy_media", LEGACY_BOOKKEEPING).await
}
