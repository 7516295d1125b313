pub mod ajax;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod migration;
pub mod time;

pub use config::MigrationConfig;
pub use error::{AppError, AppResult};
pub use logging::init as init_logging;
pub use migration::{ChunkReport, MigrationContext, Migrator, Stage};
