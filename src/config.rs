use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

pub const MIN_CHUNK_SIZE: i64 = 1;
pub const MAX_CHUNK_SIZE: i64 = 100;
pub const DEFAULT_CHUNK_SIZE: i64 = 5;

pub const ENV_TOKEN_SECRET: &str = "MEDIASHIFT_TOKEN_SECRET";
pub const ENV_LOG_FILTER: &str = "MEDIASHIFT_LOG";
pub const APP_DIR_NAME: &str = "mediashift";

/// Installation settings for one migration run.
///
/// Everything the original host resolved through ambient site options is
/// carried here explicitly and handed to every component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationConfig {
    pub blog_id: i64,
    pub site_url: String,
    pub upload_dir: PathBuf,
    pub upload_url: String,
    /// Directory (under `upload_dir`) that receives migrated files.
    pub target_root: String,
    pub media_slug: String,
    pub members_slug: String,
    pub groups_slug: String,
    pub chunk_size: i64,
    pub token_secret: Option<String>,
    pub lease_ttl_secs: i64,
    pub log_dir: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            blog_id: 1,
            site_url: "http://localhost".into(),
            upload_dir: PathBuf::from("wp-content/uploads"),
            upload_url: "http://localhost/wp-content/uploads/".into(),
            target_root: "rtMedia".into(),
            media_slug: "media".into(),
            members_slug: "members".into(),
            groups_slug: "groups".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            token_secret: None,
            lease_ttl_secs: 120,
            log_dir: None,
        }
    }
}

impl MigrationConfig {
    /// Loads the config file, falling back to defaults when it does not exist.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path(),
        };

        let mut config = if path.exists() {
            let data = fs::read(&path).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "config_read")
                    .with_context("path", path.display().to_string())
            })?;
            serde_json::from_slice::<MigrationConfig>(&data).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "config_decode")
                    .with_context("path", path.display().to_string())
            })?
        } else {
            tracing::debug!(
                target: "mediashift",
                event = "config_defaults",
                path = %path.display()
            );
            MigrationConfig::default()
        };

        if let Ok(secret) = std::env::var(ENV_TOKEN_SECRET) {
            if !secret.trim().is_empty() {
                config.token_secret = Some(secret);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        validate_chunk_size(self.chunk_size)?;
        if self.target_root.trim().is_empty()
            || self.target_root.contains(['/', '\\'])
            || self.target_root == ".."
        {
            return Err(AppError::new(
                "CONFIG/INVALID_TARGET_ROOT",
                "Target root must be a single directory name.",
            )
            .with_context("target_root", self.target_root.clone()));
        }
        if self.lease_ttl_secs <= 0 {
            return Err(AppError::new(
                "CONFIG/INVALID_LEASE_TTL",
                "Lease TTL must be a positive number of seconds.",
            )
            .with_context("lease_ttl_secs", self.lease_ttl_secs.to_string()));
        }
        for (name, value) in [
            ("site_url", &self.site_url),
            ("upload_url", &self.upload_url),
        ] {
            if value.trim().is_empty() {
                return Err(
                    AppError::new("CONFIG/MISSING_URL", "Site and upload URLs are required.")
                        .with_context("field", name),
                );
            }
        }
        Ok(())
    }
}

pub fn validate_chunk_size(chunk_size: i64) -> AppResult<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(AppError::new(
            "CONFIG/INVALID_CHUNK_SIZE",
            format!("Chunk size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} records."),
        )
        .with_context("chunk_size", chunk_size.to_string()));
    }
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_DIR_NAME).join("config.json")
}

pub fn default_db_path() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_DIR_NAME).join("site.sqlite3")
}
