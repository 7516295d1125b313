use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::rewriter::{import_files, rewrite_references, FileImport};
use super::MigrationContext;
use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Album,
    Photo,
    Video,
    Music,
    Other,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Album => "album",
            MediaType::Photo => "photo",
            MediaType::Video => "video",
            MediaType::Music => "music",
            MediaType::Other => "other",
        }
    }

    /// Path segment the legacy plugin used in item permalinks.
    pub fn legacy_slug(self) -> &'static str {
        match self {
            MediaType::Album => "albums",
            MediaType::Photo => "photos",
            MediaType::Video => "videos",
            MediaType::Music => "music",
            MediaType::Other => "media",
        }
    }

    /// Non-attachments are albums; attachments are classified by MIME type,
    /// guessed from the file extension when the row has none.
    pub fn classify(post_type: &str, mime_type: Option<&str>, file_path: Option<&str>) -> Self {
        if post_type != "attachment" {
            return MediaType::Album;
        }
        let mime = match mime_type.map(str::trim).filter(|m| !m.is_empty()) {
            Some(mime) => mime,
            None => file_path
                .and_then(|path| mime_guess::from_path(path).first_raw())
                .unwrap_or(""),
        };
        match mime.split('/').next().unwrap_or("") {
            "image" => MediaType::Photo,
            "audio" => MediaType::Music,
            "video" => MediaType::Video,
            _ => MediaType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaContext {
    Profile,
    Group,
}

impl MediaContext {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaContext::Profile => "profile",
            MediaContext::Group => "group",
        }
    }

    /// Positive owner ids are users; zero or negative ids are negated group ids.
    pub fn from_owner_ref(owner_ref: i64) -> (Self, i64) {
        if owner_ref > 0 {
            (MediaContext::Profile, owner_ref)
        } else {
            (MediaContext::Group, owner_ref.abs())
        }
    }
}

/// A row of `legacy_media` as the transformer sees it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LegacyRecord {
    pub id: i64,
    pub post_type: String,
    pub mime_type: Option<String>,
    pub author_id: i64,
    pub title: Option<String>,
    pub owner_ref: Option<i64>,
    pub privacy: Option<i64>,
    pub parent_id: Option<i64>,
    pub activity_id: Option<i64>,
    pub file_path: Option<String>,
    pub guid: Option<String>,
    pub import_status: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub id: i64,
    pub blog_id: i64,
    pub media_id: i64,
    pub media_type: MediaType,
    pub context: MediaContext,
    pub context_id: i64,
    pub activity_id: Option<i64>,
    pub privacy: i64,
    pub media_author: i64,
    pub media_title: String,
    pub album_id: i64,
    pub likes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Migrated(NewRecord),
    /// Already has a new record; carries its id.
    AlreadyMigrated(i64),
    /// Legacy row missing or not owned by the legacy plugin; carries the legacy id.
    Unresolved(i64),
    /// Files could not be moved. The row is flagged and no new record exists.
    Failed { legacy_id: i64, reason: String },
}

/// Legacy album id to new media id, shared across one chunk so siblings do
/// not re-resolve their album.
#[derive(Debug, Default)]
pub struct AlbumMemo {
    resolved: HashMap<i64, i64>,
    resolving: HashSet<i64>,
}

impl AlbumMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, legacy_id: i64) -> Option<i64> {
        self.resolved.get(&legacy_id).copied()
    }

    pub fn insert(&mut self, legacy_id: i64, new_id: i64) {
        self.resolved.insert(legacy_id, new_id);
    }
}

const RECORD_COLUMNS: &str = "id, post_type, mime_type, author_id, title, owner_ref, privacy, \
     parent_id, activity_id, file_path, guid, COALESCE(import_status, 0) AS import_status";

pub async fn load_record(pool: &SqlitePool, legacy_id: i64) -> AppResult<Option<LegacyRecord>> {
    sqlx::query_as::<_, LegacyRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM legacy_media WHERE id = ?1"
    ))
    .bind(legacy_id)
    .fetch_optional(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "transform_load")
            .with_context("legacy_id", legacy_id.to_string())
    })
}

/// Eligible records above `cursor` still to be migrated, ascending by id.
/// With `include_failed`, records flagged as failed are retried too.
pub async fn load_batch(
    pool: &SqlitePool,
    eligible: &str,
    cursor: i64,
    limit: i64,
    include_failed: bool,
) -> AppResult<Vec<LegacyRecord>> {
    let status = if include_failed {
        "m.import_status <= 0"
    } else {
        "m.import_status = 0"
    };
    sqlx::query_as::<_, LegacyRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM legacy_media m
          WHERE {eligible} AND m.id > ?1 AND {status}
          ORDER BY m.id
          LIMIT ?2"
    ))
    .bind(cursor)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "transform_batch")
            .with_context("cursor", cursor.to_string())
    })
}

async fn existing_media_id(ctx: &MigrationContext, legacy_id: i64) -> AppResult<Option<i64>> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM media WHERE blog_id = ?1 AND media_id = ?2")
        .bind(ctx.config.blog_id)
        .bind(legacy_id)
        .fetch_optional(&ctx.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "transform_lookup")
                .with_context("legacy_id", legacy_id.to_string())
        })
}

pub fn transform_by_id<'a>(
    ctx: &'a MigrationContext,
    legacy_id: i64,
    memo: &'a mut AlbumMemo,
) -> BoxFuture<'a, AppResult<TransformOutcome>> {
    async move {
        match load_record(&ctx.pool, legacy_id).await? {
            Some(record) => transform(ctx, &record, memo).await,
            None => Ok(TransformOutcome::Unresolved(legacy_id)),
        }
    }
    .boxed()
}

/// Migrates one legacy row, migrating its parent album first when needed.
pub fn transform<'a>(
    ctx: &'a MigrationContext,
    record: &'a LegacyRecord,
    memo: &'a mut AlbumMemo,
) -> BoxFuture<'a, AppResult<TransformOutcome>> {
    async move {
        let Some(owner_ref) = record.owner_ref else {
            return Ok(TransformOutcome::Unresolved(record.id));
        };
        if record.import_status > 0 {
            memo.insert(record.id, record.import_status);
            return Ok(TransformOutcome::AlreadyMigrated(record.import_status));
        }
        if let Some(existing) = existing_media_id(ctx, record.id).await? {
            mark_imported(&ctx.pool, record, existing, None).await?;
            memo.insert(record.id, existing);
            return Ok(TransformOutcome::AlreadyMigrated(existing));
        }

        let media_type = MediaType::classify(
            &record.post_type,
            record.mime_type.as_deref(),
            record.file_path.as_deref(),
        );
        let (context, context_id) = MediaContext::from_owner_ref(owner_ref);

        let album_id = match record.parent_id.filter(|p| *p > 0 && *p != record.id) {
            Some(parent) => match resolve_album(ctx, parent, memo).await? {
                Some(new_id) => new_id,
                None => {
                    warn!(
                        target: "mediashift",
                        event = "media_parent_unresolved",
                        legacy_id = record.id,
                        parent
                    );
                    0
                }
            },
            None => 0,
        };

        if media_type != MediaType::Album {
            let prefix = ctx.links.storage_prefix(context, context_id);
            let files = import_files(
                ctx,
                record.id,
                record.file_path.as_deref(),
                record.guid.as_deref(),
                &prefix,
            )
            .await?;
            if let FileImport::Failed { reason } = files {
                sqlx::query("UPDATE legacy_media SET import_status = -1 WHERE id = ?1")
                    .bind(record.id)
                    .execute(&ctx.pool)
                    .await?;
                warn!(
                    target: "mediashift",
                    event = "media_import_failed",
                    legacy_id = record.id,
                    reason = %reason
                );
                return Ok(TransformOutcome::Failed {
                    legacy_id: record.id,
                    reason,
                });
            }
        }

        let privacy = shared_privacy(&ctx.pool, record).await? * 10;
        let likes = match record.activity_id {
            Some(activity_id) => sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(favorite_count, 0) FROM activity WHERE id = ?1",
            )
            .bind(activity_id)
            .fetch_optional(&ctx.pool)
            .await?
            .unwrap_or(0),
            None => 0,
        };

        let mut new_record = NewRecord {
            id: 0,
            blog_id: ctx.config.blog_id,
            media_id: record.id,
            media_type,
            context,
            context_id,
            activity_id: record.activity_id,
            privacy,
            media_author: record.author_id,
            media_title: record.title.clone().unwrap_or_default(),
            album_id,
            likes,
        };
        new_record.id = insert_media(&ctx.pool, &new_record).await?;
        mark_imported(&ctx.pool, record, new_record.id, Some(likes)).await?;
        memo.insert(record.id, new_record.id);

        if let Some(activity_id) = record.activity_id {
            let copied = copy_comments(&ctx.pool, record.id, activity_id).await?;
            let permalink = ctx
                .links
                .media_permalink(context, context_id, new_record.id);
            sqlx::query("UPDATE activity SET primary_link = ?1 WHERE id = ?2")
                .bind(&permalink)
                .bind(activity_id)
                .execute(&ctx.pool)
                .await?;
            let legacy_link =
                ctx.links
                    .legacy_permalink(context, context_id, media_type, record.id);
            rewrite_references(&ctx.pool, &legacy_link, &permalink).await?;
            if copied > 0 {
                info!(
                    target: "mediashift",
                    event = "media_comments_copied",
                    legacy_id = record.id,
                    activity_id,
                    copied
                );
            }
        }

        info!(
            target: "mediashift",
            event = "media_migrated",
            legacy_id = record.id,
            new_id = new_record.id,
            media_type = media_type.as_str(),
            album_id
        );
        Ok(TransformOutcome::Migrated(new_record))
    }
    .boxed()
}

async fn resolve_album(
    ctx: &MigrationContext,
    legacy_id: i64,
    memo: &mut AlbumMemo,
) -> AppResult<Option<i64>> {
    if let Some(new_id) = memo.get(legacy_id) {
        return Ok(Some(new_id));
    }
    if let Some(new_id) = existing_media_id(ctx, legacy_id).await? {
        memo.insert(legacy_id, new_id);
        return Ok(Some(new_id));
    }
    if !memo.resolving.insert(legacy_id) {
        warn!(target: "mediashift", event = "media_parent_cycle", legacy_id);
        return Ok(None);
    }
    let outcome = transform_by_id(ctx, legacy_id, memo).await;
    memo.resolving.remove(&legacy_id);
    match outcome? {
        TransformOutcome::Migrated(album) => Ok(Some(album.id)),
        TransformOutcome::AlreadyMigrated(new_id) => Ok(Some(new_id)),
        TransformOutcome::Unresolved(_) | TransformOutcome::Failed { .. } => Ok(None),
    }
}

/// Highest legacy privacy among eligible rows sharing the record's activity.
async fn shared_privacy(pool: &SqlitePool, record: &LegacyRecord) -> AppResult<i64> {
    let own = record.privacy.unwrap_or(0);
    let Some(activity_id) = record.activity_id else {
        return Ok(own);
    };
    let shared: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(COALESCE(privacy, 0)) FROM legacy_media
          WHERE activity_id = ?1 AND owner_ref IS NOT NULL",
    )
    .bind(activity_id)
    .fetch_one(pool)
    .await?;
    Ok(shared.unwrap_or(own).max(own))
}

async fn insert_media(pool: &SqlitePool, record: &NewRecord) -> AppResult<i64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO media (blog_id, media_id, media_type, context, context_id, activity_id,
                            privacy, media_author, media_title, album_id, likes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(blog_id, media_id) DO NOTHING",
    )
    .bind(record.blog_id)
    .bind(record.media_id)
    .bind(record.media_type.as_str())
    .bind(record.context.as_str())
    .bind(record.context_id)
    .bind(record.activity_id)
    .bind(record.privacy)
    .bind(record.media_author)
    .bind(&record.media_title)
    .bind(record.album_id)
    .bind(record.likes)
    .bind(now_ms())
    .execute(&mut *tx)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "media_insert")
            .with_context("legacy_id", record.media_id.to_string())
    })?;
    let id: i64 = sqlx::query_scalar("SELECT id FROM media WHERE blog_id = ?1 AND media_id = ?2")
        .bind(record.blog_id)
        .bind(record.media_id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

async fn mark_imported(
    pool: &SqlitePool,
    record: &LegacyRecord,
    new_id: i64,
    likes: Option<i64>,
) -> AppResult<()> {
    sqlx::query(
        "UPDATE legacy_media
            SET import_status = ?1,
                old_activity_id = ?2,
                new_activity_id = ?2,
                favorites = COALESCE(?3, favorites)
          WHERE id = ?4",
    )
    .bind(new_id)
    .bind(record.activity_id)
    .bind(likes)
    .bind(record.id)
    .execute(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "media_mark_imported")
            .with_context("legacy_id", record.id.to_string())
    })?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct LegacyComment {
    id: i64,
    user_id: i64,
    parent: Option<i64>,
    content: Option<String>,
    date_recorded: Option<String>,
    display_name: Option<String>,
    email: Option<String>,
}

/// Copies the comment thread under `activity_id` onto `media_id`, keeping
/// parent/child links. Comments already in `imported_comments` are reused,
/// not re-inserted. Returns the number of comments inserted.
pub async fn copy_comments(pool: &SqlitePool, media_id: i64, activity_id: i64) -> AppResult<u64> {
    let comments = sqlx::query_as::<_, LegacyComment>(
        "SELECT c.id, c.user_id, c.secondary_item_id AS parent, c.content, c.date_recorded,
                u.display_name, u.email
           FROM activity c
           LEFT JOIN users u ON u.id = c.user_id
          WHERE c.type = 'activity_comment' AND COALESCE(c.is_spam, 0) = 0 AND c.item_id = ?1
          ORDER BY c.id",
    )
    .bind(activity_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "comments_load")
            .with_context("activity_id", activity_id.to_string())
    })?;
    if comments.is_empty() {
        return Ok(0);
    }

    let ids: HashSet<i64> = comments.iter().map(|c| c.id).collect();
    let mut children: HashMap<i64, Vec<usize>> = HashMap::new();
    for (idx, comment) in comments.iter().enumerate() {
        let parent = comment
            .parent
            .filter(|p| ids.contains(p) && *p != comment.id)
            .unwrap_or(activity_id);
        children.entry(parent).or_default().push(idx);
    }

    let mut inserted = 0u64;
    let mut visited: HashSet<i64> = HashSet::new();
    let mut stack: Vec<(usize, i64)> = children
        .get(&activity_id)
        .map(|roots| roots.iter().rev().map(|idx| (*idx, 0)).collect())
        .unwrap_or_default();
    let mut next_orphan = 0usize;

    loop {
        let Some((idx, new_parent)) = stack.pop() else {
            // Comments caught in a parent cycle are never reached from the
            // root; attach them at the top level.
            while next_orphan < comments.len() && visited.contains(&comments[next_orphan].id) {
                next_orphan += 1;
            }
            if next_orphan == comments.len() {
                break;
            }
            stack.push((next_orphan, 0));
            continue;
        };
        let comment = &comments[idx];
        if !visited.insert(comment.id) {
            continue;
        }
        let (comment_id, fresh) = insert_comment(pool, media_id, comment, new_parent).await?;
        if fresh {
            inserted += 1;
        }
        if let Some(kids) = children.get(&comment.id) {
            for kid in kids.iter().rev() {
                stack.push((*kid, comment_id));
            }
        }
    }
    Ok(inserted)
}

async fn insert_comment(
    pool: &SqlitePool,
    media_id: i64,
    comment: &LegacyComment,
    new_parent: i64,
) -> AppResult<(i64, bool)> {
    let mut tx = pool.begin().await?;
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT comment_id FROM imported_comments WHERE legacy_comment_id = ?1",
    )
    .bind(comment.id)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(comment_id) = existing {
        tx.commit().await?;
        return Ok((comment_id, false));
    }

    let result = sqlx::query(
        "INSERT INTO media_comments (media_id, parent_id, author_id, author_name, author_email,
                                     content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(media_id)
    .bind(new_parent)
    .bind(comment.user_id)
    .bind(comment.display_name.clone().unwrap_or_default())
    .bind(comment.email.clone().unwrap_or_default())
    .bind(comment.content.clone().unwrap_or_default())
    .bind(comment.date_recorded.clone().unwrap_or_default())
    .execute(&mut *tx)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "comment_insert")
            .with_context("legacy_comment_id", comment.id.to_string())
    })?;
    let comment_id = result.last_insert_rowid();

    sqlx::query(
        "INSERT INTO imported_comments (legacy_comment_id, media_id, comment_id) VALUES (?1, ?2, ?3)",
    )
    .bind(comment.id)
    .bind(media_id)
    .bind(comment_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok((comment_id, true))
}
