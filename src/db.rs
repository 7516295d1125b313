use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Sqlite};

use crate::{AppError, AppResult};

/// Opens the site database. The legacy tables must already exist; the
/// migration's own tables are installed by [`crate::migrate::apply_migrations`].
pub async fn open_sqlite_pool(db_path: &Path, create: bool) -> AppResult<Pool<Sqlite>> {
    if create {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                tracing::error!(
                    target: "mediashift",
                    event = "db_dir_create_failed",
                    error = %err,
                    path = %parent.display()
                );
                AppError::from(err)
                    .with_context("operation", "db_dir_create")
                    .with_context("path", parent.display().to_string())
            })?;
        }
    } else if !db_path.exists() {
        return Err(AppError::new("DB/NOT_FOUND", "Database file does not exist.")
            .with_context("path", db_path.display().to_string()));
    }
    tracing::info!(target: "mediashift", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "db_open")
                .with_context("path", db_path.display().to_string())
        })?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "mediashift",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "mediashift",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}
