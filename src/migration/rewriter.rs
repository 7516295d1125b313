use std::fs;
use std::path::Path;

use regex::{Captures, Regex};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

use super::MigrationContext;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Result of moving one attachment's files into the namespaced tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileImport {
    Copied { file_path: String, guid: String },
    /// Nothing to move: no file recorded, or it already lives under the target root.
    Skipped,
    Failed { reason: String },
}

/// One source/destination pair, both relative to the upload directory.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileMove {
    from: String,
    to: String,
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("source file missing: {0}")]
    MissingSource(String),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy {src} to {dest}: {source}")]
    Write {
        src: String,
        dest: String,
        #[source]
        source: std::io::Error,
    },
}

/// Copies `src` to `dest`, creating parent directories. Never touches the
/// source. A missing source whose destination already exists counts as
/// copied so a crashed attachment can be resumed.
pub fn copy_file(src: &Path, dest: &Path) -> Result<(), CopyError> {
    if !src.exists() {
        if dest.is_file() {
            info!(
                target: "mediashift",
                event = "file_copy_already_done",
                dest = %dest.display()
            );
            return Ok(());
        }
        return Err(CopyError::MissingSource(src.display().to_string()));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|source| CopyError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let tmp = dest.with_extension("partial");
    fs::copy(src, &tmp)
        .and_then(|_| fs::File::open(&tmp).and_then(|file| file.sync_all()))
        .and_then(|_| fs::rename(&tmp, dest))
        .map_err(|source| {
            let _ = fs::remove_file(&tmp);
            CopyError::Write {
                src: src.display().to_string(),
                dest: dest.display().to_string(),
                source,
            }
        })
}

/// Matches `old` only when a delimiter or the end of text follows it, so
/// `?p=1` never matches inside `?p=17`.
fn reference_pattern(old: &str) -> AppResult<Regex> {
    Regex::new(&format!(r#"{}(["'<>\s]|$)"#, regex::escape(old))).map_err(|err| {
        AppError::new("MIGRATION/REFERENCE_PATTERN", err.to_string())
            .with_context("old", old.to_string())
    })
}

fn replace_reference(pattern: &Regex, text: &str, new: &str) -> String {
    pattern
        .replace_all(text, |caps: &Captures<'_>| format!("{new}{}", &caps[1]))
        .into_owned()
}

/// Replaces `old` with `new` in the action, content and primary link of every
/// activity row, and records the pair in `reference_rewrites`.
///
/// Returns the number of activity rows changed. Empty or identical pairs are
/// ignored.
pub async fn rewrite_references(pool: &SqlitePool, old: &str, new: &str) -> AppResult<u64> {
    if old.is_empty() || old == new {
        return Ok(0);
    }
    let pattern = reference_pattern(old)?;

    let mut tx = pool.begin().await?;
    let candidates = sqlx::query(
        "SELECT id, action, content, primary_link FROM activity
          WHERE instr(COALESCE(action, ''), ?1) > 0
             OR instr(COALESCE(content, ''), ?1) > 0
             OR instr(COALESCE(primary_link, ''), ?1) > 0",
    )
    .bind(old)
    .fetch_all(&mut *tx)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "rewrite_references")
            .with_context("old", old.to_string())
    })?;

    let mut touched: u64 = 0;
    for row in &candidates {
        let id: i64 = row.try_get("id")?;
        let mut changed = false;
        let mut fields: [Option<String>; 3] = [
            row.try_get("action")?,
            row.try_get("content")?,
            row.try_get("primary_link")?,
        ];
        for field in fields.iter_mut() {
            if let Some(text) = field.as_mut() {
                let replaced = replace_reference(&pattern, text, new);
                if replaced != *text {
                    *text = replaced;
                    changed = true;
                }
            }
        }
        if !changed {
            continue;
        }
        let [action, content, primary_link] = fields;
        sqlx::query(
            "UPDATE activity SET action = ?1, content = ?2, primary_link = ?3 WHERE id = ?4",
        )
        .bind(action)
        .bind(content)
        .bind(primary_link)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "rewrite_references")
                .with_context("activity_id", id.to_string())
        })?;
        touched += 1;
    }

    sqlx::query(
        "INSERT INTO reference_rewrites (old_ref, new_ref, rows_touched, applied_at)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(old)
    .bind(new)
    .bind(touched as i64)
    .bind(now_ms())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(
        target: "mediashift",
        event = "reference_rewrite",
        old = %old,
        new = %new,
        rows = touched
    );
    Ok(touched)
}

fn sibling(relative: &str, file_name: &str) -> String {
    match relative.rfind('/') {
        Some(idx) => format!("{}/{}", &relative[..idx], file_name),
        None => file_name.to_string(),
    }
}

fn log_delete_decision(path: &Path, deleted: bool, reason: &str) {
    info!(
        target: "mediashift",
        event = "media_import_source_delete",
        path = %path.display(),
        deleted,
        reason
    );
}

/// Moves one attachment (original plus every size, backup and share
/// thumbnail) under `<target root>/<prefix>/`.
///
/// Copies everything first. Only when every copy succeeded are the URLs
/// rewritten, the sources deleted and the legacy row repointed. Any failure
/// leaves all sources where they were.
pub async fn import_files(
    ctx: &MigrationContext,
    legacy_id: i64,
    file_path: Option<&str>,
    guid: Option<&str>,
    prefix: &str,
) -> AppResult<FileImport> {
    let relative = match file_path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(relative) => relative.trim_start_matches('/').to_string(),
        None => return Ok(FileImport::Skipped),
    };
    if ctx.links.is_migrated_path(&relative) {
        return Ok(FileImport::Skipped);
    }

    let mut moves = vec![FileMove {
        to: ctx.links.target_relative(prefix, &relative),
        from: relative.clone(),
    }];

    let variants = sqlx::query(
        "SELECT file FROM legacy_media_variants WHERE media_id = ?1 ORDER BY kind, name",
    )
    .bind(legacy_id)
    .fetch_all(&ctx.pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "media_import_variants")
            .with_context("legacy_id", legacy_id.to_string())
    })?;
    for row in variants {
        let file: String = row.try_get("file")?;
        let file = file.trim();
        if file.is_empty() {
            continue;
        }
        let from = sibling(&relative, file);
        if moves.iter().any(|m| m.from == from) {
            continue;
        }
        moves.push(FileMove {
            to: ctx.links.target_relative(prefix, &from),
            from,
        });
    }

    let upload_dir = &ctx.config.upload_dir;
    for file_move in &moves {
        let src = upload_dir.join(&file_move.from);
        let dest = upload_dir.join(&file_move.to);
        if let Err(err) = copy_file(&src, &dest) {
            warn!(
                target: "mediashift",
                event = "media_import_copy_failed",
                legacy_id,
                file = %file_move.from,
                error = %err
            );
            return Ok(FileImport::Failed {
                reason: err.to_string(),
            });
        }
    }

    for file_move in &moves {
        rewrite_references(
            &ctx.pool,
            &ctx.links.upload_url(&file_move.from),
            &ctx.links.upload_url(&file_move.to),
        )
        .await?;
    }

    let new_guid = ctx.links.upload_url(&moves[0].to);
    if let Some(old_guid) = guid.filter(|g| !g.is_empty()) {
        rewrite_references(&ctx.pool, old_guid, &new_guid).await?;
    }

    for file_move in &moves {
        let src = upload_dir.join(&file_move.from);
        match fs::remove_file(&src) {
            Ok(()) => log_delete_decision(&src, true, "copied"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log_delete_decision(&src, false, "already_removed")
            }
            Err(err) => {
                warn!(
                    target: "mediashift",
                    event = "media_import_source_delete_failed",
                    path = %src.display(),
                    error = %err
                );
                log_delete_decision(&src, false, "delete_failed");
            }
        }
    }

    let new_path = moves[0].to.clone();
    sqlx::query("UPDATE legacy_media SET file_path = ?1, guid = ?2 WHERE id = ?3")
        .bind(&new_path)
        .bind(&new_guid)
        .bind(legacy_id)
        .execute(&ctx.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "media_import_repoint")
                .with_context("legacy_id", legacy_id.to_string())
        })?;

    info!(
        target: "mediashift",
        event = "media_import_files_moved",
        legacy_id,
        files = moves.len(),
        path = %new_path
    );
    Ok(FileImport::Copied {
        file_path: new_path,
        guid: new_guid,
    })
}
