//! Request/response driver for the polling admin client.
//!
//! Each accepted request runs exactly one chunk and answers with the
//! progress the client needs to issue the next one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::migration::progress::{format_duration, total_count};
use crate::migration::{MigrationState, Migrator, Stage};
use crate::{AppError, AppResult};

pub const ACTION: &str = "media_migration_chunk";
pub const REJECTED_BODY: &str = "0";

/// Form parameters sent by the client. Numbers arrive as strings and are
/// parsed leniently; a blank `last_id` means "resume".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AjaxRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub done: Option<String>,
    #[serde(default)]
    pub last_id: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

fn parse_number(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse::<i64>().ok())
}

impl AjaxRequest {
    pub fn last_id(&self) -> Option<i64> {
        parse_number(self.last_id.as_deref()).filter(|id| *id > 0)
    }

    pub fn limit(&self) -> Option<i64> {
        parse_number(self.limit.as_deref())
    }

    pub fn done(&self) -> Option<i64> {
        parse_number(self.done.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPayload {
    /// `false` once the run is complete; the client stops polling.
    pub status: bool,
    pub done: i64,
    pub total: i64,
    pub pending: String,
    pub last_id: i64,
    pub stage: Stage,
    #[serde(default)]
    pub busy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AjaxResponse {
    Rejected,
    Progress(ProgressPayload),
}

impl AjaxResponse {
    pub fn body(&self) -> String {
        match self {
            AjaxResponse::Rejected => REJECTED_BODY.to_string(),
            AjaxResponse::Progress(payload) => {
                serde_json::to_string(payload).unwrap_or_else(|_| REJECTED_BODY.to_string())
            }
        }
    }
}

impl IntoResponse for AjaxResponse {
    fn into_response(self) -> Response {
        match self {
            AjaxResponse::Rejected => REJECTED_BODY.into_response(),
            AjaxResponse::Progress(payload) => Json(payload).into_response(),
        }
    }
}

/// Issues and checks anti-forgery tokens: hex `sha256("<secret>:<action>")`.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: String,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue(&self, action: &str) -> String {
        format!(
            "{:x}",
            Sha256::digest(format!("{}:{}", self.secret, action).as_bytes())
        )
    }

    pub fn verify(&self, action: &str, token: &str) -> bool {
        let expected = self.issue(action);
        let (a, b) = (expected.as_bytes(), token.trim().as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

pub struct AjaxDriver {
    migrator: Migrator,
    verifier: Option<TokenVerifier>,
    default_limit: i64,
}

impl AjaxDriver {
    /// Without a token secret every request is rejected.
    pub fn new(migrator: Migrator) -> Self {
        let config = migrator.context().config.clone();
        Self {
            verifier: config.token_secret.as_deref().map(TokenVerifier::new),
            default_limit: config.chunk_size,
            migrator,
        }
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Validates the action and token, then runs one chunk. A rejected
    /// request writes nothing.
    pub async fn handle_request(&self, request: AjaxRequest) -> AppResult<AjaxResponse> {
        if request.action != ACTION {
            warn!(
                target: "mediashift",
                event = "ajax_rejected",
                reason = "unknown_action",
                action = %request.action
            );
            return Ok(AjaxResponse::Rejected);
        }
        let trusted = self
            .verifier
            .as_ref()
            .map(|verifier| verifier.verify(ACTION, &request.nonce))
            .unwrap_or(false);
        if !trusted {
            warn!(
                target: "mediashift",
                event = "ajax_rejected",
                reason = if self.verifier.is_some() { "bad_nonce" } else { "no_secret" }
            );
            return Ok(AjaxResponse::Rejected);
        }

        let limit = request
            .limit()
            .unwrap_or(self.default_limit)
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        info!(
            target: "mediashift",
            event = "ajax_chunk",
            client_done = request.done().unwrap_or(-1),
            last_id = request.last_id().unwrap_or(0),
            limit
        );

        match self.migrator.run_chunk(request.last_id(), limit).await {
            Ok(report) => Ok(AjaxResponse::Progress(ProgressPayload {
                status: !report.completed,
                done: report.done,
                total: report.total,
                pending: format_duration(report.pending),
                last_id: report.next_cursor,
                stage: report.stage,
                busy: false,
            })),
            Err(err) if err.code() == "MIGRATION/BUSY" => {
                self.busy_response().await.map(AjaxResponse::Progress)
            }
            Err(err) => Err(err),
        }
    }

    /// Last persisted progress, read without touching migration state.
    async fn busy_response(&self) -> AppResult<ProgressPayload> {
        let pool = &self.migrator.context().pool;
        let state = MigrationState::load(pool).await?;
        let total = total_count(pool, state.album_total.unwrap_or(0)).await?;
        let pending = state.pending.unwrap_or(total).clamp(0, total);
        Ok(ProgressPayload {
            status: state.stage != Stage::Complete,
            done: total - pending,
            total,
            pending: format_duration(pending),
            last_id: state.last_imported_id,
            stage: state.stage,
            busy: true,
        })
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    stage: Stage,
}

async fn admin_ajax(
    State(driver): State<Arc<AjaxDriver>>,
    form: Result<Form<AjaxRequest>, FormRejection>,
) -> Response {
    let Ok(Form(request)) = form else {
        return AjaxResponse::Rejected.into_response();
    };
    match driver.handle_request(request).await {
        Ok(response) => response.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err)).into_response(),
    }
}

async fn health(State(driver): State<Arc<AjaxDriver>>) -> Response {
    match MigrationState::load(&driver.migrator.context().pool).await {
        Ok(state) => Json(Health {
            status: "ok",
            stage: state.stage,
        })
        .into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, Json(err)).into_response(),
    }
}

pub fn router(driver: Arc<AjaxDriver>) -> Router {
    Router::new()
        .route("/admin-ajax", post(admin_ajax))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(driver)
}

pub async fn serve(driver: Arc<AjaxDriver>, addr: SocketAddr) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "serve_bind")
            .with_context("addr", addr.to_string())
    })?;
    info!(target: "mediashift", event = "serve_listening", addr = %addr);
    axum::serve(listener, router(driver))
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "serve"))?;
    Ok(())
}
