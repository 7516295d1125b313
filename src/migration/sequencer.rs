use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use super::prober::{ensure_legacy_bookkeeping, table_exists};
use super::progress::{self, default_albums_subquery, eligible_filter, Progress};
use super::rewriter::rewrite_references;
use super::state::{
    acquire_lease, get_option, get_option_i64, release_lease, set_option, set_option_i64,
    MigrationState, Stage, KEY_CURSOR, KEY_GLOBAL_ALBUM, KEY_GLOBAL_ALBUM_LEGACY,
    KEY_IMAGE_SIZE_FIX, KEY_ROUTES_FLUSHED,
};
use super::transformer::{
    load_batch, transform, AlbumMemo, MediaContext, MediaType, TransformOutcome,
};
use super::MigrationContext;
use crate::config::validate_chunk_size;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Default albums pruned per call, and users scanned per favourites slice.
pub const ALBUM_BATCH: i64 = 10;
pub const FAVORITES_BATCH: i64 = 10;

pub const GLOBAL_ALBUM_TITLE: &str = "Wall Posts";

const LEGACY_LIST_OPEN: &str = r#"<ul class="bp-media-list-media">"#;
const MEDIA_LIST_OPEN: &str =
    r#"<div class="rtmedia-activity-container"><ul class="rtmedia-list large-block-grid-3">"#;

/// Legacy encoding-service option keys and the names the new plugin reads.
const LEGACY_OPTION_RENAMES: &[(&str, &str)] = &[
    ("bp-media-encoding-api-key", "rtmedia-encoding-api-key"),
    (
        "bp-media-encoding-usage-limit-mail",
        "rtmedia-encoding-usage-limit-mail",
    ),
    ("bp-media-encoding-usage", "rtmedia-encoding-usage"),
    (
        "bpmedia_encoding_service_notice",
        "rtmedia-encoding-service-notice",
    ),
    (
        "bpmedia_encoding_expansion_notice",
        "rtmedia-encoding-expansion-notice",
    ),
    ("bp_media_ffmpeg_options", "rtmedia-ffmpeg-options"),
    ("bp_media_kaltura_options", "rtmedia-kaltura-options"),
];

/// Told when the URL layout changed so routing caches can be rebuilt.
pub trait RouteNotifier: Send + Sync {
    fn routes_changed(&self);
}

pub struct TracingRouteNotifier;

impl RouteNotifier for TracingRouteNotifier {
    fn routes_changed(&self) {
        info!(target: "mediashift", event = "migration_routes_changed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub done: i64,
    pub total: i64,
    pub pending: i64,
    pub next_cursor: i64,
    pub stage: Stage,
    pub completed: bool,
    pub processed: u64,
}

/// The album every default per-owner album is folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalAlbum {
    pub legacy_id: i64,
    pub media_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slice {
    /// The step filled its batch; stop here and let the client call again.
    Saturated,
    /// Nothing left for this step; move to the next stage.
    Exhausted,
}

pub struct Migrator {
    ctx: MigrationContext,
    notifier: Arc<dyn RouteNotifier>,
}

impl Migrator {
    pub fn new(ctx: MigrationContext) -> Self {
        Self {
            ctx,
            notifier: Arc::new(TracingRouteNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RouteNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    /// Adds the legacy bookkeeping columns and creates the global album.
    pub async fn prepare(&self) -> AppResult<GlobalAlbum> {
        if !ensure_legacy_bookkeeping(&self.ctx.pool).await {
            return Err(AppError::new(
                "MIGRATION/SCHEMA",
                "Legacy media table is missing or cannot be extended.",
            )
            .with_context("table", "legacy_media"));
        }
        self.ensure_global_album().await
    }

    /// Current counts without doing any migration work.
    pub async fn progress(&self) -> AppResult<Progress> {
        self.prepare().await?;
        let mut state = MigrationState::load(&self.ctx.pool).await?;
        progress::snapshot(&self.ctx.pool, &mut state).await
    }

    /// Runs one bounded slice of the migration.
    ///
    /// `last_id` overrides the stored cursor; `None` resumes from it. The
    /// chunk holds the migration lease for its whole duration and fails with
    /// `MIGRATION/BUSY` when another chunk is running.
    pub async fn run_chunk(&self, last_id: Option<i64>, limit: i64) -> AppResult<ChunkReport> {
        validate_chunk_size(limit)?;
        let holder = Uuid::now_v7().to_string();
        acquire_lease(&self.ctx.pool, &holder, self.ctx.config.lease_ttl_secs).await?;

        let result = self.run_chunk_locked(last_id, limit).await;

        if let Err(err) = release_lease(&self.ctx.pool, &holder).await {
            warn!(
                target: "mediashift",
                event = "migration_lease_release_failed",
                holder = %holder,
                error = %err
            );
        }
        if let Err(err) = &result {
            warn!(
                target: "mediashift",
                event = "migration_chunk_failed",
                code = %err.code(),
                error = %err
            );
        }
        result
    }

    async fn run_chunk_locked(&self, last_id: Option<i64>, limit: i64) -> AppResult<ChunkReport> {
        let pool = &self.ctx.pool;
        let global = self.prepare().await?;
        let mut state = MigrationState::load(pool).await?;
        if let Some(cursor) = last_id {
            state.last_imported_id = cursor.max(0);
        }
        progress::snapshot(pool, &mut state).await?;

        let mut processed = 0u64;
        loop {
            let stage = state.stage;
            let slice = match stage {
                Stage::AlbumsRewritten => self.rewrite_album_markup(global).await?,
                Stage::UserAlbumsPruned => self.prune_user_albums(global).await?,
                Stage::GroupAlbumsPruned => self.prune_group_albums(global).await?,
                Stage::PostTypeRenamed => self.rename_post_types().await?,
                Stage::MediaAndComments => {
                    self.import_media(&mut state, limit, &mut processed).await?
                }
                Stage::Favorites => self.import_favorites(&mut state).await?,
                Stage::Complete => break,
            };
            if slice == Slice::Saturated {
                break;
            }
            state.stage = stage.next();
            if state.stage == Stage::Complete {
                self.finish().await?;
            }
            state.save(pool).await?;
            info!(
                target: "mediashift",
                event = "migration_stage_advanced",
                from = stage.label(),
                to = state.stage.label()
            );
        }

        let progress = progress::snapshot(pool, &mut state).await?;
        state.save(pool).await?;

        let report = ChunkReport {
            done: progress.done,
            total: progress.total,
            pending: progress.pending,
            next_cursor: state.last_imported_id,
            stage: state.stage,
            completed: state.stage == Stage::Complete,
            processed,
        };
        info!(
            target: "mediashift",
            event = "migration_chunk",
            stage = report.stage.label(),
            done = report.done,
            total = report.total,
            pending = report.pending,
            cursor = report.next_cursor,
            processed = report.processed
        );
        Ok(report)
    }

    async fn ensure_global_album(&self) -> AppResult<GlobalAlbum> {
        let pool = &self.ctx.pool;
        if let (Some(legacy_id), Some(media_id)) = (
            get_option_i64(pool, KEY_GLOBAL_ALBUM_LEGACY).await?,
            get_option_i64(pool, KEY_GLOBAL_ALBUM).await?,
        ) {
            return Ok(GlobalAlbum {
                legacy_id,
                media_id,
            });
        }

        let mut tx = pool.begin().await?;
        let legacy_id = sqlx::query(
            "INSERT INTO legacy_media (post_type, author_id, title, owner_ref, privacy, parent_id)
             VALUES ('album', 0, ?1, NULL, 0, 0)",
        )
        .bind(GLOBAL_ALBUM_TITLE)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            AppError::new("MIGRATION/GLOBAL_ALBUM", "Could not create the global album.")
                .with_context("operation", "global_album_legacy")
                .with_cause(err)
        })?
        .last_insert_rowid();

        let media_id = sqlx::query(
            "INSERT INTO media (blog_id, media_id, media_type, context, context_id, privacy,
                                media_author, media_title, album_id, likes, created_at)
             VALUES (?1, ?2, 'album', 'profile', 0, 0, 0, ?3, 0, 0, ?4)",
        )
        .bind(self.ctx.config.blog_id)
        .bind(legacy_id)
        .bind(GLOBAL_ALBUM_TITLE)
        .bind(now_ms())
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            AppError::new("MIGRATION/GLOBAL_ALBUM", "Could not create the global album.")
                .with_context("operation", "global_album_media")
                .with_cause(err)
        })?
        .last_insert_rowid();

        sqlx::query("UPDATE legacy_media SET import_status = ?1 WHERE id = ?2")
            .bind(media_id)
            .bind(legacy_id)
            .execute(&mut *tx)
            .await?;
        for (name, value) in [
            (KEY_GLOBAL_ALBUM_LEGACY, legacy_id),
            (KEY_GLOBAL_ALBUM, media_id),
        ] {
            sqlx::query(
                "INSERT INTO options (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            )
            .bind(name)
            .bind(value.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(
            target: "mediashift",
            event = "global_album_created",
            legacy_id,
            media_id
        );
        Ok(GlobalAlbum {
            legacy_id,
            media_id,
        })
    }

    /// Rewrites the legacy list markup in activity content and moves every
    /// item of a default album into the global album.
    async fn rewrite_album_markup(&self, global: GlobalAlbum) -> AppResult<Slice> {
        let pool = &self.ctx.pool;
        let markup = sqlx::query(
            "UPDATE activity
                SET content = replace(replace(content, '</ul>', '</ul></div>'), ?1, ?2)
              WHERE instr(COALESCE(content, ''), ?1) > 0",
        )
        .bind(LEGACY_LIST_OPEN)
        .bind(MEDIA_LIST_OPEN)
        .execute(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "album_markup_rewrite"))?
        .rows_affected();

        let defaults = default_albums_subquery(pool).await;
        let repointed = sqlx::query(&format!(
            "UPDATE legacy_media SET parent_id = ?1 WHERE parent_id IN ({defaults})"
        ))
        .bind(global.legacy_id)
        .execute(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "album_children_repoint"))?
        .rows_affected();

        info!(
            target: "mediashift",
            event = "album_markup_rewritten",
            activities = markup,
            children = repointed
        );
        Ok(Slice::Exhausted)
    }

    async fn prune_user_albums(&self, global: GlobalAlbum) -> AppResult<Slice> {
        let pool = &self.ctx.pool;
        if !table_exists(pool, "legacy_user_albums").await {
            return Ok(Slice::Exhausted);
        }
        let rows = sqlx::query(
            "SELECT m.id, m.author_id, m.guid FROM legacy_media m
              WHERE m.id IN (SELECT album_id FROM legacy_user_albums)
              ORDER BY m.id
              LIMIT ?1",
        )
        .bind(ALBUM_BATCH)
        .fetch_all(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "user_albums_load"))?;

        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let author: i64 = row.try_get("author_id")?;
            let guid: Option<String> = row.try_get("guid")?;
            let target =
                self.ctx
                    .links
                    .media_permalink(MediaContext::Profile, author, global.media_id);
            if let Some(guid) = guid {
                rewrite_references(pool, &guid, &target).await?;
            }
            let legacy =
                self.ctx
                    .links
                    .legacy_permalink(MediaContext::Profile, author, MediaType::Album, id);
            rewrite_references(pool, &legacy, &target).await?;
            self.delete_legacy_album(id).await?;
        }

        info!(target: "mediashift", event = "user_albums_pruned", count = rows.len());
        Ok(slice_for(rows.len() as i64, ALBUM_BATCH))
    }

    async fn prune_group_albums(&self, global: GlobalAlbum) -> AppResult<Slice> {
        let pool = &self.ctx.pool;
        if !table_exists(pool, "legacy_group_albums").await {
            return Ok(Slice::Exhausted);
        }
        let rows = sqlx::query(
            "SELECT m.id, g.group_id FROM legacy_media m
               JOIN legacy_group_albums g ON g.album_id = m.id
              ORDER BY m.id
              LIMIT ?1",
        )
        .bind(ALBUM_BATCH)
        .fetch_all(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "group_albums_load"))?;

        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let group_id: i64 = row.try_get("group_id")?;
            let group_id = group_id.abs();
            rewrite_references(
                pool,
                &self.ctx.links.legacy_group_album_link(group_id, id),
                &self
                    .ctx
                    .links
                    .media_permalink(MediaContext::Group, group_id, global.media_id),
            )
            .await?;
            self.delete_legacy_album(id).await?;
        }

        info!(target: "mediashift", event = "group_albums_pruned", count = rows.len());
        Ok(slice_for(rows.len() as i64, ALBUM_BATCH))
    }

    async fn delete_legacy_album(&self, legacy_id: i64) -> AppResult<()> {
        sqlx::query("DELETE FROM legacy_media WHERE id = ?1")
            .bind(legacy_id)
            .execute(&self.ctx.pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "album_delete")
                    .with_context("legacy_id", legacy_id.to_string())
            })?;
        Ok(())
    }

    /// Renames legacy album rows, fixes legacy image-size names once and
    /// carries renamed option keys over.
    async fn rename_post_types(&self) -> AppResult<Slice> {
        let pool = &self.ctx.pool;
        let renamed = sqlx::query(
            "UPDATE legacy_media SET post_type = 'album' WHERE post_type = 'legacy_album'",
        )
        .execute(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "post_type_rename"))?
        .rows_affected();

        if get_option(pool, KEY_IMAGE_SIZE_FIX).await?.is_none() {
            if table_exists(pool, "legacy_media_variants").await {
                sqlx::query(
                    "UPDATE legacy_media_variants SET name = replace(name, 'bp_media', 'rt_media')
                      WHERE kind = 'size'",
                )
                .execute(pool)
                .await
                .map_err(|err| AppError::from(err).with_context("operation", "image_size_fix"))?;
            }
            set_option(pool, KEY_IMAGE_SIZE_FIX, "fix").await?;
        }

        for (old, new) in LEGACY_OPTION_RENAMES {
            if let Some(value) = get_option(pool, old).await? {
                set_option(pool, new, &value).await?;
            }
        }

        info!(target: "mediashift", event = "post_types_renamed", rows = renamed);
        Ok(Slice::Exhausted)
    }

    async fn import_media(
        &self,
        state: &mut MigrationState,
        limit: i64,
        processed: &mut u64,
    ) -> AppResult<Slice> {
        let pool = &self.ctx.pool;
        let defaults = default_albums_subquery(pool).await;
        let eligible = eligible_filter(&defaults);

        let mut batch = load_batch(pool, &eligible, state.last_imported_id, limit, true).await?;
        if batch.is_empty() {
            let lowest: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT MIN(m.id) FROM legacy_media m WHERE {eligible} AND m.import_status = 0"
            ))
            .fetch_one(pool)
            .await?;
            if let Some(lowest) = lowest {
                info!(
                    target: "mediashift",
                    event = "migration_cursor_rewind",
                    from = state.last_imported_id,
                    to = lowest - 1
                );
                state.last_imported_id = lowest - 1;
                batch = load_batch(pool, &eligible, state.last_imported_id, limit, false).await?;
            }
        }

        let mut memo = AlbumMemo::new();
        for record in &batch {
            match transform(&self.ctx, record, &mut memo).await? {
                TransformOutcome::Migrated(_) | TransformOutcome::AlreadyMigrated(_) => {}
                TransformOutcome::Unresolved(legacy_id) => {
                    warn!(target: "mediashift", event = "media_unresolved", legacy_id);
                }
                TransformOutcome::Failed { legacy_id, reason } => {
                    warn!(
                        target: "mediashift",
                        event = "media_failed",
                        legacy_id,
                        reason = %reason
                    );
                }
            }
            *processed += 1;
            state.last_imported_id = state.last_imported_id.max(record.id);
            set_option_i64(pool, KEY_CURSOR, state.last_imported_id).await?;
        }

        let pending = progress::pending_count(pool, None).await?;
        Ok(if pending > 0 {
            Slice::Saturated
        } else {
            Slice::Exhausted
        })
    }

    /// Turns the legacy per-user favourites into like interactions on the
    /// migrated media sharing the favourite activity.
    async fn import_favorites(&self, state: &mut MigrationState) -> AppResult<Slice> {
        let pool = &self.ctx.pool;
        if !table_exists(pool, "legacy_favorites").await {
            return Ok(Slice::Exhausted);
        }
        let users: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM users ORDER BY id LIMIT ?1 OFFSET ?2")
                .bind(FAVORITES_BATCH)
                .bind(state.favorites_offset)
                .fetch_all(pool)
                .await
                .map_err(|err| AppError::from(err).with_context("operation", "favorites_users"))?;

        let mut likes = 0u64;
        for user_id in &users {
            likes += sqlx::query(
                "INSERT OR IGNORE INTO media_interactions (user_id, media_id, action, value)
                 SELECT f.user_id, md.id, 'like', 1
                   FROM legacy_favorites f
                   JOIN media md ON md.activity_id = f.activity_id AND md.blog_id = ?1
                  WHERE f.user_id = ?2",
            )
            .bind(self.ctx.config.blog_id)
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "favorites_import")
                    .with_context("user_id", user_id.to_string())
            })?
            .rows_affected();
        }
        state.favorites_offset += users.len() as i64;

        info!(
            target: "mediashift",
            event = "favorites_imported",
            users = users.len(),
            likes,
            offset = state.favorites_offset
        );
        Ok(slice_for(users.len() as i64, FAVORITES_BATCH))
    }

    async fn finish(&self) -> AppResult<()> {
        self.notifier.routes_changed();
        set_option_i64(&self.ctx.pool, KEY_ROUTES_FLUSHED, now_ms()).await?;
        info!(target: "mediashift", event = "migration_complete");
        Ok(())
    }
}

fn slice_for(rows: i64, batch: i64) -> Slice {
    if rows < batch {
        Slice::Exhausted
    } else {
        Slice::Saturated
    }
}
