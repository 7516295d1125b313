#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;

use mediashift_lib::migration::progress::done_count;
use mediashift_lib::migration::state::{acquire_lease, MigrationState, KEY_GLOBAL_ALBUM};
use mediashift_lib::migration::transformer::{transform_by_id, AlbumMemo, TransformOutcome};
use mediashift_lib::{Migrator, Stage};

mod util;
use util::{insert_photo, scalar, site};

#[tokio::test]
async fn seven_records_finish_in_two_chunks_of_five() -> Result<()> {
    let (ctx, _uploads) = site().await;
    let mut ids = Vec::new();
    for _ in 0..7 {
        ids.push(insert_photo(&ctx.pool, 1, 0).await);
    }
    let migrator = Migrator::new(ctx.clone());

    let first = migrator.run_chunk(None, 5).await?;
    assert_eq!(first.done, 5);
    assert_eq!(first.total, 7);
    assert_eq!(first.pending, 2);
    assert_eq!(first.stage, Stage::MediaAndComments);
    assert_eq!(first.next_cursor, ids[4]);
    assert!(!first.completed);

    let second = migrator.run_chunk(None, 5).await?;
    assert_eq!(second.done, 7);
    assert_eq!(second.total, 7);
    assert_eq!(second.pending, 0);
    assert!(second.completed);
    assert_eq!(second.stage, Stage::Complete);

    let photos = scalar(&ctx.pool, "SELECT COUNT(*) FROM media WHERE media_type = 'photo'").await;
    assert_eq!(photos, 7);
    let unmarked = scalar(
        &ctx.pool,
        "SELECT COUNT(*) FROM legacy_media WHERE owner_ref IS NOT NULL AND import_status <= 0",
    )
    .await;
    assert_eq!(unmarked, 0);
    Ok(())
}

#[tokio::test]
async fn progress_is_monotonic_and_converges() -> Result<()> {
    let (ctx, _uploads) = site().await;
    for n in 0..23 {
        insert_photo(&ctx.pool, if n % 3 == 0 { -4 } else { 2 }, 0).await;
    }
    let migrator = Migrator::new(ctx.clone());

    let limit = 5;
    let bound = (23 + limit - 1) / limit;
    let mut last_done = 0;
    let mut calls = 0;
    loop {
        let report = migrator.run_chunk(None, limit).await?;
        calls += 1;
        assert!(report.done >= last_done, "done went backwards");
        assert_eq!(report.total, 23);
        assert!(report.done <= report.total);
        last_done = report.done;
        if report.completed {
            break;
        }
        assert!(calls < bound, "did not converge within {bound} calls");
    }
    assert_eq!(last_done, 23);
    assert_eq!(calls, bound);

    let groups = scalar(
        &ctx.pool,
        "SELECT COUNT(*) FROM media WHERE context = 'group' AND context_id = 4",
    )
    .await;
    assert_eq!(groups, 8);
    Ok(())
}

#[tokio::test]
async fn rerunning_from_an_old_cursor_creates_no_duplicates() -> Result<()> {
    let (ctx, _uploads) = site().await;
    for _ in 0..4 {
        insert_photo(&ctx.pool, 1, 0).await;
    }
    let migrator = Migrator::new(ctx.clone());

    migrator.run_chunk(None, 2).await?;
    migrator.run_chunk(Some(0), 2).await?;
    let report = migrator.run_chunk(Some(0), 2).await?;

    assert!(report.completed);
    assert_eq!(report.done, 4);
    let photos = scalar(&ctx.pool, "SELECT COUNT(*) FROM media WHERE media_type = 'photo'").await;
    assert_eq!(photos, 4);
    let distinct = scalar(&ctx.pool, "SELECT COUNT(DISTINCT media_id) FROM media").await;
    assert_eq!(distinct, scalar(&ctx.pool, "SELECT COUNT(*) FROM media").await);
    Ok(())
}

#[tokio::test]
async fn record_inserted_before_a_crash_is_reused() -> Result<()> {
    let (ctx, _uploads) = site().await;
    let legacy_id = insert_photo(&ctx.pool, 3, 0).await;
    Migrator::new(ctx.clone()).prepare().await?;

    // New row written, legacy row never marked.
    let new_id = sqlx::query(
        "INSERT INTO media (blog_id, media_id, media_type, context, context_id, media_author,
                            created_at)
         VALUES (?1, ?2, 'photo', 'profile', 3, 3, 0)",
    )
    .bind(ctx.config.blog_id)
    .bind(legacy_id)
    .execute(&ctx.pool)
    .await?
    .last_insert_rowid();

    let mut memo = AlbumMemo::new();
    let outcome = transform_by_id(&ctx, legacy_id, &mut memo).await?;
    assert_eq!(outcome, TransformOutcome::AlreadyMigrated(new_id));
    assert_eq!(memo.get(legacy_id), Some(new_id));

    let status = scalar(
        &ctx.pool,
        &format!("SELECT import_status FROM legacy_media WHERE id = {legacy_id}"),
    )
    .await;
    assert_eq!(status, new_id);

    let again = transform_by_id(&ctx, legacy_id, &mut AlbumMemo::new()).await?;
    assert_eq!(again, TransformOutcome::AlreadyMigrated(new_id));
    let rows = scalar(&ctx.pool, "SELECT COUNT(*) FROM media WHERE media_type = 'photo'").await;
    assert_eq!(rows, 1);
    Ok(())
}

#[tokio::test]
async fn rows_without_owner_are_left_alone() -> Result<()> {
    let (ctx, _uploads) = site().await;
    let orphan = sqlx::query(
        "INSERT INTO legacy_media (post_type, mime_type, author_id, title, owner_ref)
         VALUES ('attachment', 'image/png', 9, 'site logo', NULL)",
    )
    .execute(&ctx.pool)
    .await?
    .last_insert_rowid();
    insert_photo(&ctx.pool, 1, 0).await;

    let report = Migrator::new(ctx.clone()).run_chunk(None, 5).await?;
    assert!(report.completed);
    assert_eq!(report.total, 1);

    let mut memo = AlbumMemo::new();
    let outcome = transform_by_id(&ctx, orphan, &mut memo).await?;
    assert_eq!(outcome, TransformOutcome::Unresolved(orphan));
    let missing = transform_by_id(&ctx, 9_999, &mut memo).await?;
    assert_eq!(missing, TransformOutcome::Unresolved(9_999));
    Ok(())
}

#[tokio::test]
async fn global_album_is_created_once() -> Result<()> {
    let (ctx, _uploads) = site().await;
    let migrator = Migrator::new(ctx.clone());
    let first = migrator.prepare().await?;
    let second = migrator.prepare().await?;
    assert_eq!(first, second);

    let stored = mediashift_lib::migration::state::get_option_i64(&ctx.pool, KEY_GLOBAL_ALBUM)
        .await?
        .expect("global album id stored");
    assert_eq!(stored, first.media_id);
    let albums = scalar(&ctx.pool, "SELECT COUNT(*) FROM media WHERE media_type = 'album'").await;
    assert_eq!(albums, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_chunk_is_refused_while_lease_is_held() -> Result<()> {
    let (ctx, _uploads) = site().await;
    insert_photo(&ctx.pool, 1, 0).await;
    acquire_lease(&ctx.pool, "another-worker", 120).await?;

    let err = Migrator::new(ctx.clone())
        .run_chunk(None, 5)
        .await
        .expect_err("lease held elsewhere");
    assert_eq!(err.code(), "MIGRATION/BUSY");

    let state = MigrationState::load(&ctx.pool).await?;
    assert_eq!(state.stage, Stage::AlbumsRewritten);
    assert_eq!(
        scalar(&ctx.pool, "SELECT COUNT(*) FROM media").await,
        0,
        "nothing written while busy"
    );
    Ok(())
}

#[tokio::test]
async fn chunk_size_out_of_range_is_rejected() -> Result<()> {
    let (ctx, _uploads) = site().await;
    let migrator = Migrator::new(ctx);
    let err = migrator.run_chunk(None, 0).await.expect_err("zero limit");
    assert_eq!(err.code(), "CONFIG/INVALID_CHUNK_SIZE");
    let err = migrator.run_chunk(None, 101).await.expect_err("limit too large");
    assert_eq!(err.code(), "CONFIG/INVALID_CHUNK_SIZE");
    Ok(())
}

#[tokio::test]
async fn photos_sharing_an_activity_take_the_strictest_privacy() -> Result<()> {
    let (ctx, _uploads) = site().await;
    let open = insert_photo(&ctx.pool, 1, 0).await;
    let private = insert_photo(&ctx.pool, 1, 0).await;
    for (id, privacy) in [(open, 0), (private, 6)] {
        sqlx::query("UPDATE legacy_media SET activity_id = 40, privacy = ?1 WHERE id = ?2")
            .bind(privacy)
            .bind(id)
            .execute(&ctx.pool)
            .await?;
    }

    let report = Migrator::new(ctx.clone()).run_chunk(None, 5).await?;
    assert!(report.completed);

    let rows: Vec<(i64, i64)> =
        sqlx::query_as("SELECT media_id, privacy FROM media ORDER BY media_id")
            .fetch_all(&ctx.pool)
            .await?;
    assert_eq!(rows, vec![(open, 60), (private, 60)]);
    Ok(())
}

#[tokio::test]
async fn done_count_tracks_completed_records() -> Result<()> {
    let (ctx, _uploads) = site().await;
    for _ in 0..7 {
        insert_photo(&ctx.pool, 1, 0).await;
    }

    let report = Migrator::new(ctx.clone()).run_chunk(None, 5).await?;
    assert_eq!(done_count(&ctx.pool, 0).await?, report.done);
    assert_eq!(report.done, 5);
    Ok(())
}
