#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;

use mediashift_lib::ajax::{AjaxDriver, AjaxRequest, AjaxResponse, ProgressPayload, TokenVerifier, ACTION};
use mediashift_lib::migration::state::acquire_lease;
use mediashift_lib::{MigrationContext, Migrator, Stage};

mod util;
use util::{insert_photo, scalar, site, temp_pool, test_config, SECRET};

fn request(nonce: &str, last_id: &str, limit: &str) -> AjaxRequest {
    AjaxRequest {
        action: ACTION.into(),
        nonce: nonce.into(),
        done: Some("0".into()),
        last_id: Some(last_id.into()),
        limit: Some(limit.into()),
    }
}

fn token() -> String {
    TokenVerifier::new(SECRET).issue(ACTION)
}

fn progress(response: AjaxResponse) -> ProgressPayload {
    match response {
        AjaxResponse::Progress(payload) => payload,
        AjaxResponse::Rejected => panic!("request was rejected"),
    }
}

#[tokio::test]
async fn bad_token_is_rejected_without_side_effects() -> Result<()> {
    let (ctx, _uploads) = site().await;
    insert_photo(&ctx.pool, 1, 0).await;
    let driver = AjaxDriver::new(Migrator::new(ctx.clone()));

    let response = driver.handle_request(request("forged", "0", "5")).await?;
    assert_eq!(response, AjaxResponse::Rejected);
    assert_eq!(response.body(), "0");

    let mut wrong_action = request(&token(), "0", "5");
    wrong_action.action = "heartbeat".into();
    assert_eq!(
        driver.handle_request(wrong_action).await?,
        AjaxResponse::Rejected
    );

    assert_eq!(scalar(&ctx.pool, "SELECT COUNT(*) FROM options").await, 0);
    assert_eq!(scalar(&ctx.pool, "SELECT COUNT(*) FROM media").await, 0);
    Ok(())
}

#[tokio::test]
async fn requests_are_rejected_when_no_secret_is_configured() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let mut config = test_config(uploads.path());
    config.token_secret = None;
    let ctx = MigrationContext::new(temp_pool().await, config);
    let driver = AjaxDriver::new(Migrator::new(ctx.clone()));

    let response = driver.handle_request(request(&token(), "0", "5")).await?;
    assert_eq!(response, AjaxResponse::Rejected);
    assert_eq!(scalar(&ctx.pool, "SELECT COUNT(*) FROM options").await, 0);
    Ok(())
}

#[tokio::test]
async fn each_request_runs_one_chunk_until_done() -> Result<()> {
    let (ctx, _uploads) = site().await;
    let first_id = insert_photo(&ctx.pool, 1, 0).await;
    insert_photo(&ctx.pool, 1, 0).await;
    let driver = AjaxDriver::new(Migrator::new(ctx.clone()));

    let first = progress(driver.handle_request(request(&token(), "", "1")).await?);
    assert!(first.status);
    assert!(!first.busy);
    assert_eq!(first.done, 1);
    assert_eq!(first.total, 2);
    assert_eq!(first.pending, "1 second");
    assert_eq!(first.last_id, first_id);
    assert_eq!(first.stage, Stage::MediaAndComments);

    let second = progress(
        driver
            .handle_request(request(&token(), &first.last_id.to_string(), "1"))
            .await?,
    );
    assert!(!second.status);
    assert_eq!(second.done, 2);
    assert_eq!(second.pending, "No time remaining.");

    let after = progress(driver.handle_request(request(&token(), "0", "1")).await?);
    assert!(!after.status);
    assert_eq!(after.done, after.total);
    Ok(())
}

#[tokio::test]
async fn out_of_range_limit_is_clamped() -> Result<()> {
    let (ctx, _uploads) = site().await;
    for _ in 0..3 {
        insert_photo(&ctx.pool, 1, 0).await;
    }
    let driver = AjaxDriver::new(Migrator::new(ctx.clone()));

    let payload = progress(driver.handle_request(request(&token(), "0", "5000")).await?);
    assert!(!payload.status);
    assert_eq!(payload.done, 3);
    Ok(())
}

#[tokio::test]
async fn busy_migration_reports_last_known_progress() -> Result<()> {
    let (ctx, _uploads) = site().await;
    insert_photo(&ctx.pool, 1, 0).await;
    acquire_lease(&ctx.pool, "another-worker", 120).await?;
    let driver = AjaxDriver::new(Migrator::new(ctx.clone()));

    let payload = progress(driver.handle_request(request(&token(), "0", "5")).await?);
    assert!(payload.busy);
    assert!(payload.status);
    assert_eq!(payload.total, 1);
    assert_eq!(payload.done, 0);
    assert_eq!(payload.stage, Stage::AlbumsRewritten);
    assert_eq!(scalar(&ctx.pool, "SELECT COUNT(*) FROM media").await, 0);

    let body: serde_json::Value = serde_json::from_str(&AjaxResponse::Progress(payload).body())?;
    assert_eq!(body["busy"], true);
    assert_eq!(body["stage"], "albums_rewritten");
    Ok(())
}
