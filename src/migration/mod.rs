//! Staged migration of legacy media albums into the new media schema.
//!
//! One call to [`Migrator::run_chunk`] performs one bounded slice of work and
//! persists where it stopped, so the run can be driven by a polling client
//! and resumed after a crash.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::MigrationConfig;

pub mod links;
pub mod prober;
pub mod progress;
pub mod report;
pub mod rewriter;
pub mod sequencer;
pub mod state;
pub mod transformer;

pub use links::LinkBuilder;
pub use progress::{format_duration, Progress};
pub use sequencer::{ChunkReport, Migrator, RouteNotifier, TracingRouteNotifier};
pub use state::{MigrationState, Stage};
pub use transformer::{AlbumMemo, NewRecord, TransformOutcome};

/// Everything a migration component needs, handed over explicitly instead
/// of being looked up from ambient site options.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub pool: SqlitePool,
    pub config: Arc<MigrationConfig>,
    pub links: LinkBuilder,
}

impl MigrationContext {
    pub fn new(pool: SqlitePool, config: MigrationConfig) -> Self {
        let links = LinkBuilder::new(&config);
        Self {
            pool,
            config: Arc::new(config),
            links,
        }
    }
}
