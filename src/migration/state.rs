use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::time::now_secs;
use crate::{AppError, AppResult};

pub const KEY_STAGE: &str = "media_migration.stage";
pub const KEY_CURSOR: &str = "media_migration.last_imported_id";
pub const KEY_PENDING: &str = "media_migration.pending";
pub const KEY_ALBUM_TOTAL: &str = "media_migration.album_total";
pub const KEY_FAVORITES_OFFSET: &str = "media_migration.favorites_offset";
pub const KEY_HIDE_NOTICE: &str = "media_migration.hide_notice";
pub const KEY_LEASE: &str = "media_migration.lease";
pub const KEY_ROUTES_FLUSHED: &str = "media_migration.routes_flushed_at";
pub const KEY_GLOBAL_ALBUM: &str = "media_migration.global_album_id";
pub const KEY_GLOBAL_ALBUM_LEGACY: &str = "media_migration.global_album_legacy_id";
pub const KEY_IMAGE_SIZE_FIX: &str = "media_migration.image_size_fix";

/// Migration steps in execution order. The stored code is the step that
/// runs next; it only ever grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AlbumsRewritten,
    UserAlbumsPruned,
    GroupAlbumsPruned,
    PostTypeRenamed,
    MediaAndComments,
    Favorites,
    Complete,
}

impl Stage {
    pub const fn code(self) -> i64 {
        match self {
            Stage::AlbumsRewritten => 0,
            Stage::UserAlbumsPruned => 1,
            Stage::GroupAlbumsPruned => 2,
            Stage::PostTypeRenamed => 3,
            Stage::MediaAndComments => 5,
            Stage::Favorites => 6,
            Stage::Complete => 7,
        }
    }

    /// Code 4 is an interim value some installs were left on while the
    /// post-type rename was in flight; it resumes that step.
    pub fn from_code(code: i64) -> Stage {
        match code {
            i64::MIN..=0 => Stage::AlbumsRewritten,
            1 => Stage::UserAlbumsPruned,
            2 => Stage::GroupAlbumsPruned,
            3 | 4 => Stage::PostTypeRenamed,
            5 => Stage::MediaAndComments,
            6 => Stage::Favorites,
            _ => Stage::Complete,
        }
    }

    pub fn next(self) -> Stage {
        match self {
            Stage::AlbumsRewritten => Stage::UserAlbumsPruned,
            Stage::UserAlbumsPruned => Stage::GroupAlbumsPruned,
            Stage::GroupAlbumsPruned => Stage::PostTypeRenamed,
            Stage::PostTypeRenamed => Stage::MediaAndComments,
            Stage::MediaAndComments => Stage::Favorites,
            Stage::Favorites | Stage::Complete => Stage::Complete,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::AlbumsRewritten => "albums_rewritten",
            Stage::UserAlbumsPruned => "user_albums_pruned",
            Stage::GroupAlbumsPruned => "group_albums_pruned",
            Stage::PostTypeRenamed => "post_type_renamed",
            Stage::MediaAndComments => "media_and_comments",
            Stage::Favorites => "favorites",
            Stage::Complete => "complete",
        }
    }
}

pub async fn get_option(pool: &SqlitePool, name: &str) -> AppResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT value FROM options WHERE name = ?1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "option_get")
                .with_context("name", name.to_string())
        })
}

pub async fn get_option_i64(pool: &SqlitePool, name: &str) -> AppResult<Option<i64>> {
    Ok(get_option(pool, name)
        .await?
        .and_then(|value| value.trim().parse::<i64>().ok()))
}

pub async fn set_option(pool: &SqlitePool, name: &str, value: &str) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO options (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
    )
    .bind(name)
    .bind(value)
    .execute(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "option_set")
            .with_context("name", name.to_string())
    })?;
    Ok(())
}

pub async fn set_option_i64(pool: &SqlitePool, name: &str, value: i64) -> AppResult<()> {
    set_option(pool, name, &value.to_string()).await
}

/// Persisted progress of the run. Only the sequencer writes it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    pub stage: Stage,
    pub last_imported_id: i64,
    pub pending: Option<i64>,
    pub album_total: Option<i64>,
    pub favorites_offset: i64,
}

impl MigrationState {
    pub async fn load(pool: &SqlitePool) -> AppResult<Self> {
        let stage = get_option_i64(pool, KEY_STAGE).await?.unwrap_or(0);
        Ok(Self {
            stage: Stage::from_code(stage),
            last_imported_id: get_option_i64(pool, KEY_CURSOR).await?.unwrap_or(0),
            pending: get_option_i64(pool, KEY_PENDING).await?,
            album_total: get_option_i64(pool, KEY_ALBUM_TOTAL).await?,
            favorites_offset: get_option_i64(pool, KEY_FAVORITES_OFFSET)
                .await?
                .unwrap_or(0),
        })
    }

    pub async fn save(&self, pool: &SqlitePool) -> AppResult<()> {
        let stored = get_option_i64(pool, KEY_STAGE).await?.unwrap_or(0);
        if Stage::from_code(stored) > self.stage {
            return Err(AppError::new(
                "MIGRATION/STAGE_REGRESSION",
                "Refusing to move the migration stage backwards.",
            )
            .with_context("stored", stored.to_string())
            .with_context("requested", self.stage.code().to_string()));
        }
        set_option_i64(pool, KEY_STAGE, self.stage.code()).await?;
        set_option_i64(pool, KEY_CURSOR, self.last_imported_id).await?;
        set_option_i64(pool, KEY_FAVORITES_OFFSET, self.favorites_offset).await?;
        if let Some(pending) = self.pending {
            set_option_i64(pool, KEY_PENDING, pending).await?;
        }
        if let Some(total) = self.album_total {
            set_option_i64(pool, KEY_ALBUM_TOTAL, total).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseValue {
    holder: String,
    expires_at: i64,
}

/// Claims the single-writer lease for one chunk.
///
/// Succeeds when nobody holds it, when the previous holder's lease expired,
/// or when `holder` already owns it. Returns `MIGRATION/BUSY` otherwise.
pub async fn acquire_lease(pool: &SqlitePool, holder: &str, ttl_secs: i64) -> AppResult<()> {
    let now = now_secs();
    let value = serde_json::to_string(&LeaseValue {
        holder: holder.to_string(),
        expires_at: now + ttl_secs,
    })?;

    let claimed = sqlx::query(
        "INSERT INTO options (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value
         WHERE json_extract(options.value, '$.expires_at') < ?3
            OR json_extract(options.value, '$.holder') = ?4",
    )
    .bind(KEY_LEASE)
    .bind(&value)
    .bind(now)
    .bind(holder)
    .execute(pool)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "lease_acquire"))?
    .rows_affected();

    if claimed == 0 {
        let current = get_option(pool, KEY_LEASE)
            .await?
            .and_then(|raw| serde_json::from_str::<LeaseValue>(&raw).ok());
        let mut err = AppError::new(
            "MIGRATION/BUSY",
            "Another migration chunk is already running.",
        );
        if let Some(current) = current {
            err = err
                .with_context("holder", current.holder)
                .with_context("expires_at", current.expires_at.to_string());
        }
        return Err(err);
    }
    Ok(())
}

pub async fn release_lease(pool: &SqlitePool, holder: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM options WHERE name = ?1 AND json_extract(value, '$.holder') = ?2")
        .bind(KEY_LEASE)
        .bind(holder)
        .execute(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "lease_release"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        apply_migrations(&pool).await.expect("schema");
        pool
    }

    #[test]
    fn stage_codes_round_trip_and_only_grow() {
        let mut stage = Stage::AlbumsRewritten;
        while stage != Stage::Complete {
            let next = stage.next();
            assert!(next > stage);
            assert!(next.code() > stage.code());
            assert_eq!(Stage::from_code(stage.code()), stage);
            stage = next;
        }
        assert_eq!(Stage::from_code(4), Stage::PostTypeRenamed);
    }

    #[tokio::test]
    async fn fresh_state_starts_at_first_stage() {
        let pool = pool().await;
        let state = MigrationState::load(&pool).await.expect("load");
        assert_eq!(state.stage, Stage::AlbumsRewritten);
        assert_eq!(state.last_imported_id, 0);
        assert_eq!(state.album_total, None);
    }

    #[tokio::test]
    async fn save_refuses_to_regress_stage() {
        let pool = pool().await;
        set_option_i64(&pool, KEY_STAGE, Stage::MediaAndComments.code())
            .await
            .expect("seed stage");
        let mut state = MigrationState::load(&pool).await.expect("load");
        state.stage = Stage::UserAlbumsPruned;
        let err = state.save(&pool).await.expect_err("regression rejected");
        assert_eq!(err.code(), "MIGRATION/STAGE_REGRESSION");
    }

    #[tokio::test]
    async fn lease_excludes_second_holder_until_released() {
        let pool = pool().await;
        acquire_lease(&pool, "a", 60).await.expect("first holder");
        acquire_lease(&pool, "a", 60).await.expect("re-entrant for same holder");

        let err = acquire_lease(&pool, "b", 60).await.expect_err("busy");
        assert_eq!(err.code(), "MIGRATION/BUSY");
        assert_eq!(err.context().get("holder"), Some(&"a".to_string()));

        release_lease(&pool, "a").await.expect("release");
        acquire_lease(&pool, "b", 60).await.expect("free after release");
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let pool = pool().await;
        acquire_lease(&pool, "stale", -5).await.expect("expired lease");
        acquire_lease(&pool, "fresh", 60).await.expect("takeover");
    }
}
