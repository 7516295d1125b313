#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;

use sqlx::{sqlite::SqlitePoolOptions, Executor, SqlitePool};
use tempfile::TempDir;

use mediashift_lib::migrate::apply_migrations;
use mediashift_lib::{MigrationConfig, MigrationContext};

pub const SITE: &str = "http://example.test";
pub const UPLOADS: &str = "http://example.test/uploads/";
pub const SECRET: &str = "s3cret";

const LEGACY_SCHEMA: &str = include_str!("fixtures/legacy_schema.sql");

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    pool.execute(LEGACY_SCHEMA).await.expect("legacy schema");
    apply_migrations(&pool).await.expect("apply migrations");
    pool
}

pub fn test_config(upload_dir: &Path) -> MigrationConfig {
    MigrationConfig {
        site_url: SITE.into(),
        upload_dir: upload_dir.to_path_buf(),
        upload_url: UPLOADS.into(),
        token_secret: Some(SECRET.into()),
        ..MigrationConfig::default()
    }
}

/// A context over a fresh legacy site whose uploads live in the returned dir.
pub async fn site() -> (MigrationContext, TempDir) {
    let uploads = tempfile::tempdir().expect("tempdir");
    let pool = temp_pool().await;
    let ctx = MigrationContext::new(pool, test_config(uploads.path()));
    (ctx, uploads)
}

pub async fn insert_user(pool: &SqlitePool, id: i64, name: &str) {
    sqlx::query("INSERT INTO users (id, display_name, email) VALUES (?1, ?2, ?3)")
        .bind(id)
        .bind(name)
        .bind(format!("{}@example.test", name.to_lowercase()))
        .execute(pool)
        .await
        .unwrap();
}

pub async fn insert_album(pool: &SqlitePool, owner_ref: i64, title: &str) -> i64 {
    sqlx::query(
        "INSERT INTO legacy_media (post_type, author_id, title, owner_ref, privacy, parent_id)
         VALUES ('legacy_album', ?1, ?2, ?3, 0, 0)",
    )
    .bind(owner_ref.abs())
    .bind(title)
    .bind(owner_ref)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

/// Attachment without a file on disk; migrates without touching the upload dir.
pub async fn insert_photo(pool: &SqlitePool, owner_ref: i64, parent_id: i64) -> i64 {
    sqlx::query(
        "INSERT INTO legacy_media (post_type, mime_type, author_id, title, owner_ref, privacy, parent_id)
         VALUES ('attachment', 'image/jpeg', ?1, 'photo', ?2, 0, ?3)",
    )
    .bind(owner_ref.abs())
    .bind(owner_ref)
    .bind(parent_id)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

/// Attachment whose file sits at `relative` under the upload dir.
pub async fn insert_file_photo(
    pool: &SqlitePool,
    uploads: &Path,
    owner_ref: i64,
    relative: &str,
) -> i64 {
    let path = uploads.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"jpeg-bytes").unwrap();
    sqlx::query(
        "INSERT INTO legacy_media (post_type, mime_type, author_id, title, owner_ref, privacy,
                                   parent_id, file_path, guid)
         VALUES ('attachment', 'image/jpeg', ?1, 'photo', ?2, 0, 0, ?3, ?4)",
    )
    .bind(owner_ref.abs())
    .bind(owner_ref)
    .bind(relative)
    .bind(format!("{UPLOADS}{relative}"))
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

pub async fn insert_activity(pool: &SqlitePool, user_id: i64, content: &str) -> i64 {
    sqlx::query(
        "INSERT INTO activity (user_id, component, type, action, content, primary_link)
         VALUES (?1, 'activity', 'activity_update', '', ?2, '')",
    )
    .bind(user_id)
    .bind(content)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

pub async fn insert_comment(
    pool: &SqlitePool,
    id: i64,
    activity_id: i64,
    parent: i64,
    user_id: i64,
    content: &str,
) {
    sqlx::query(
        "INSERT INTO activity (id, user_id, component, type, content, item_id, secondary_item_id,
                               date_recorded)
         VALUES (?1, ?2, 'activity', 'activity_comment', ?3, ?4, ?5, '2013-04-01 10:00:00')",
    )
    .bind(id)
    .bind(user_id)
    .bind(content)
    .bind(activity_id)
    .bind(parent)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn scalar(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql)
        .fetch_one(pool)
        .await
        .unwrap()
}
