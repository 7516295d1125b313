use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use crate::{AppError, AppResult};
use tracing::{error, info};

static ADD_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)").expect("valid regex")
});

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        format!("{}…", &trimmed[..160])
    } else {
        trimmed.to_string()
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202610190901_media.sql",
        include_str!("../migrations/202610190901_media.sql"),
    ),
    (
        "202610190902_comments.sql",
        include_str!("../migrations/202610190902_comments.sql"),
    ),
    (
        "202610190903_interactions.sql",
        include_str!("../migrations/202610190903_interactions.sql"),
    ),
    (
        "202610190904_migration_state.sql",
        include_str!("../migrations/202610190904_migration_state.sql"),
    ),
];

fn clean_sql(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(cleaned: &str) -> String {
    format!("{:x}", Sha256::digest(cleaned.as_bytes()))
}

/// Installs the new media schema next to the legacy tables. Safe to call on
/// every start; applied files are skipped by checksum.
pub async fn apply_migrations(pool: &SqlitePool) -> AppResult<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "schema_migrations_create"))?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "schema_migrations_load"))?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = clean_sql(raw_sql);
        let sum = checksum(&cleaned);

        if let Some(stored) = applied.get(*filename) {
            if stored != &sum {
                return Err(AppError::new(
                    "MIGRATION/SCHEMA",
                    "Schema file was edited after it was applied.",
                )
                .with_context("file", filename.to_string()));
            }
            info!(target: "mediashift", event = "schema_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            if let Some(caps) = ADD_COLUMN_RE.captures(s) {
                let table = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let col = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                let exists: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2",
                )
                .bind(table)
                .bind(col)
                .fetch_optional(&mut *tx)
                .await?;
                if exists.is_some() {
                    info!(target: "mediashift", event = "schema_stmt_skip", file = %filename, sql = %preview(s));
                    continue;
                }
            }
            info!(target: "mediashift", event = "schema_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "mediashift", event = "schema_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(AppError::from(e)
                    .with_context("operation", "schema_apply")
                    .with_context("file", filename.to_string()));
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&sum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "mediashift", event = "schema_file_applied", file = %filename);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_sql_drops_comment_lines() {
        let cleaned = clean_sql("-- note\nCREATE TABLE t (id INTEGER);\n\n  -- more\n");
        assert_eq!(cleaned, "CREATE TABLE t (id INTEGER);");
    }

    #[tokio::test]
    async fn applying_twice_is_a_no_op() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        apply_migrations(&pool).await.expect("first apply");
        apply_migrations(&pool).await.expect("second apply");

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }
}
