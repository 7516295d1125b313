use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::prober::table_exists;
use super::state::{set_option_i64, MigrationState, KEY_ALBUM_TOTAL, KEY_PENDING};
use crate::{AppError, AppResult};

/// Counts reported to the driver after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub done: i64,
    pub total: i64,
    pub pending: i64,
}

/// Subquery listing the per-owner default albums. The group table is
/// optional on installs without groups.
pub async fn default_albums_subquery(pool: &SqlitePool) -> String {
    let mut parts = Vec::new();
    if table_exists(pool, "legacy_user_albums").await {
        parts.push("SELECT album_id FROM legacy_user_albums WHERE album_id IS NOT NULL");
    }
    if table_exists(pool, "legacy_group_albums").await {
        parts.push("SELECT album_id FROM legacy_group_albums WHERE album_id IS NOT NULL");
    }
    if parts.is_empty() {
        "SELECT NULL WHERE 0".to_string()
    } else {
        parts.join(" UNION ")
    }
}

/// Filter for legacy rows the migration owns: rows the legacy plugin managed
/// (non-null owner) that are not default albums.
pub fn eligible_filter(defaults: &str) -> String {
    format!("m.owner_ref IS NOT NULL AND m.id NOT IN ({defaults})")
}

async fn scalar(pool: &SqlitePool, sql: &str, cursor: Option<i64>, op: &str) -> AppResult<i64> {
    let mut query = sqlx::query_scalar::<_, i64>(sql);
    if let Some(cursor) = cursor {
        query = query.bind(cursor);
    }
    query.fetch_one(pool).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", op.to_string())
    })
}

/// Default albums still present in the legacy table.
pub async fn remaining_default_albums(pool: &SqlitePool) -> AppResult<i64> {
    let defaults = default_albums_subquery(pool).await;
    let sql = format!("SELECT COUNT(*) FROM legacy_media WHERE id IN ({defaults})");
    scalar(pool, &sql, None, "progress_default_albums").await
}

/// Everything the run will account for: the default-album snapshot, the
/// eligible legacy records and the distinct comments hanging off their
/// activities.
pub async fn total_count(pool: &SqlitePool, album_total: i64) -> AppResult<i64> {
    let defaults = default_albums_subquery(pool).await;
    let eligible = eligible_filter(&defaults);

    let media = scalar(
        pool,
        &format!("SELECT COUNT(*) FROM legacy_media m WHERE {eligible}"),
        None,
        "progress_total_media",
    )
    .await?;
    let comments = scalar(
        pool,
        &format!(
            "SELECT COUNT(DISTINCT c.id) FROM activity c
             WHERE c.type = 'activity_comment' AND COALESCE(c.is_spam, 0) = 0
               AND c.item_id IN (
                 SELECT m.activity_id FROM legacy_media m
                 WHERE {eligible} AND m.activity_id IS NOT NULL
               )"
        ),
        None,
        "progress_total_comments",
    )
    .await?;

    Ok(album_total.max(0) + media + comments)
}

/// Work still outstanding. With `cursor`, only records above it count
/// towards the media and comment parts.
pub async fn pending_count(pool: &SqlitePool, cursor: Option<i64>) -> AppResult<i64> {
    let defaults = default_albums_subquery(pool).await;
    let eligible = eligible_filter(&defaults);
    let bound = if cursor.is_some() { " AND m.id > ?1" } else { "" };
    let pending_media = format!("{eligible} AND m.import_status = 0{bound}");

    let albums = scalar(
        pool,
        &format!("SELECT COUNT(*) FROM legacy_media WHERE id IN ({defaults})"),
        None,
        "progress_pending_albums",
    )
    .await?;
    let media = scalar(
        pool,
        &format!("SELECT COUNT(*) FROM legacy_media m WHERE {pending_media}"),
        cursor,
        "progress_pending_media",
    )
    .await?;
    let comments = scalar(
        pool,
        &format!(
            "SELECT COUNT(DISTINCT c.id) FROM activity c
             WHERE c.type = 'activity_comment' AND COALESCE(c.is_spam, 0) = 0
               AND c.id NOT IN (SELECT legacy_comment_id FROM imported_comments)
               AND c.item_id IN (
                 SELECT m.activity_id FROM legacy_media m
                 WHERE {pending_media} AND m.activity_id IS NOT NULL
               )"
        ),
        cursor,
        "progress_pending_comments",
    )
    .await?;

    Ok(albums + media + comments)
}

/// Clamps a raw pending count into `[0, total]` and derives `done` from it.
fn split(total: i64, pending: i64) -> Progress {
    let total = total.max(0);
    let pending = pending.clamp(0, total);
    Progress {
        done: total - pending,
        total,
        pending,
    }
}

pub async fn done_count(pool: &SqlitePool, album_total: i64) -> AppResult<i64> {
    let total = total_count(pool, album_total).await?;
    let pending = pending_count(pool, None).await?;
    Ok(split(total, pending).done)
}

/// Computes done/total/pending and persists `pending` so a later status
/// call can answer without recounting. Takes the default-album snapshot on
/// first use.
pub async fn snapshot(pool: &SqlitePool, state: &mut MigrationState) -> AppResult<Progress> {
    let album_total = match state.album_total {
        Some(total) => total,
        None => {
            let total = remaining_default_albums(pool).await?;
            set_option_i64(pool, KEY_ALBUM_TOTAL, total).await?;
            state.album_total = Some(total);
            total
        }
    };

    let progress = split(
        total_count(pool, album_total).await?,
        pending_count(pool, None).await?,
    );

    set_option_i64(pool, KEY_PENDING, progress.pending).await?;
    state.pending = Some(progress.pending);

    Ok(progress)
}

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Renders a remaining-work estimate, one unit per second.
///
/// `format_duration(65) == "1 minute, 5 seconds"`; zero components are
/// dropped and `0` renders as `"No time remaining."`.
pub fn format_duration(seconds: i64) -> String {
    let mut left = seconds.max(0);
    let days = left / DAY;
    left %= DAY;
    let hours = left / HOUR;
    left %= HOUR;
    let minutes = left / MINUTE;
    let secs = left % MINUTE;

    let parts: Vec<String> = [
        (days, "day"),
        (hours, "hour"),
        (minutes, "minute"),
        (secs, "second"),
    ]
    .into_iter()
    .filter(|(value, _)| *value > 0)
    .map(|(value, unit)| {
        if value > 1 {
            format!("{value} {unit}s")
        } else {
            format!("{value} {unit}")
        }
    })
    .collect();

    if parts.is_empty() {
        "No time remaining.".to_string()
    } else {
        parts.join(", ")
    }
}
