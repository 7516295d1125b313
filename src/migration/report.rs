use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::prober::{column_exists, table_exists};
use super::state::{
    get_option, get_option_i64, set_option, MigrationState, Stage, KEY_HIDE_NOTICE, KEY_PENDING,
};
use super::{MigrationContext, Migrator};
use crate::{AppError, AppResult};

/// Legacy helper tables that nothing reads once the run is complete.
pub const LEGACY_HELPER_TABLES: &[&str] =
    &["legacy_user_albums", "legacy_group_albums", "legacy_favorites"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub stage: Stage,
    pub pending: i64,
    pub notice_hidden: bool,
    /// Whether the operator should be nudged to run the migration.
    pub show_notice: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CorruptMedia {
    pub id: i64,
    pub title: Option<String>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub dropped_tables: Vec<String>,
    pub removed_dirs: u64,
}

/// Pending count and notice flag. Uses the count cached by the last chunk
/// unless `force` is set or nothing is cached yet.
pub async fn migration_status(ctx: &MigrationContext, force: bool) -> AppResult<MigrationStatus> {
    let pool = &ctx.pool;
    let cached = if force {
        None
    } else {
        get_option_i64(pool, KEY_PENDING).await?
    };
    let pending = match cached {
        Some(pending) => pending,
        None => Migrator::new(ctx.clone()).progress().await?.pending,
    };
    let notice_hidden = get_option(pool, KEY_HIDE_NOTICE).await?.is_some();
    let stage = MigrationState::load(pool).await?.stage;

    Ok(MigrationStatus {
        stage,
        pending,
        notice_hidden,
        show_notice: pending > 0 && !notice_hidden,
    })
}

pub async fn hide_notice(ctx: &MigrationContext) -> AppResult<()> {
    set_option(&ctx.pool, KEY_HIDE_NOTICE, "1").await?;
    info!(target: "mediashift", event = "migration_notice_hidden");
    Ok(())
}

/// Legacy records whose files could not be moved.
pub async fn corrupt_media(ctx: &MigrationContext) -> AppResult<Vec<CorruptMedia>> {
    if !column_exists(&ctx.pool, "legacy_media", "import_status").await {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, CorruptMedia>(
        "SELECT id, title, file_path FROM legacy_media WHERE import_status = -1 ORDER BY id",
    )
    .fetch_all(&ctx.pool)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "corrupt_media"))
}

/// Drops the legacy helper tables and prunes empty legacy upload
/// directories. Refused until the run is complete.
pub async fn cleanup_legacy(ctx: &MigrationContext) -> AppResult<CleanupReport> {
    let pool = &ctx.pool;
    let stage = MigrationState::load(pool).await?.stage;
    if stage != Stage::Complete {
        return Err(AppError::new(
            "MIGRATION/NOT_COMPLETE",
            "Legacy data can only be removed after the migration completed.",
        )
        .with_context("stage", stage.label()));
    }

    let mut report = CleanupReport::default();
    for table in LEGACY_HELPER_TABLES {
        if !table_exists(pool, table).await {
            continue;
        }
        sqlx::query(&format!("DROP TABLE {table}"))
            .execute(pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "cleanup_drop_table")
                    .with_context("table", table.to_string())
            })?;
        report.dropped_tables.push(table.to_string());
    }

    report.removed_dirs = prune_empty_dirs(&ctx.config.upload_dir, ctx.links.target_root());
    info!(
        target: "mediashift",
        event = "migration_cleanup",
        tables = report.dropped_tables.len(),
        dirs = report.removed_dirs
    );
    Ok(report)
}

fn prune_empty_dirs(upload_dir: &Path, target_root: &str) -> u64 {
    let keep = upload_dir.join(target_root);
    let mut removed = 0;
    for entry in WalkDir::new(upload_dir)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !entry.file_type().is_dir() || path.starts_with(&keep) {
            continue;
        }
        let empty = fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !empty {
            continue;
        }
        match fs::remove_dir(path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(
                target: "mediashift",
                event = "cleanup_remove_dir_failed",
                path = %path.display(),
                error = %err
            ),
        }
    }
    removed
}
