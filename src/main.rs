use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::info;

use mediashift_lib::{
    ajax::{self, AjaxDriver, TokenVerifier},
    config::{self, MigrationConfig},
    db::open_sqlite_pool,
    migrate::apply_migrations,
    migration::{format_duration, report},
    AppError, ChunkReport, MigrationContext, Migrator,
};

#[derive(Parser)]
#[command(
    name = "mediashift",
    about = "Migrate legacy media albums into the new media schema"
)]
struct Cli {
    /// Site database holding the legacy tables.
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run chunks until the migration completes")]
    Run(RunArgs),
    #[command(about = "Run a single chunk and print its progress")]
    Chunk(ChunkArgs),
    #[command(about = "Show pending work and whether the notice is shown")]
    Status {
        /// Recount instead of using the cached pending count.
        #[arg(long)]
        force: bool,
    },
    #[command(about = "List legacy media whose files could not be moved")]
    Report,
    #[command(about = "Stop nagging about a pending migration")]
    HideNotice,
    #[command(about = "Remove legacy helper tables and empty upload directories")]
    Cleanup,
    #[command(about = "Serve the polling endpoint")]
    Serve {
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8787")]
        addr: SocketAddr,
    },
    #[command(about = "Print the anti-forgery token for the chunk endpoint")]
    Token,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_name = "N")]
    limit: Option<i64>,

    /// Print one JSON line per chunk instead of a human summary.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ChunkArgs {
    #[arg(long, value_name = "ID")]
    last_id: Option<i64>,

    #[arg(long, value_name = "N")]
    limit: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = MigrationConfig::load(cli.config.as_deref()).map_err(cli_error)?;
    let _guard = mediashift_lib::init_logging(config.log_dir.as_deref());
    let db_path = cli.db.unwrap_or_else(config::default_db_path);

    match cli.command {
        Command::Token => print_token(&config),
        Command::Run(args) => run(args, open_context(&db_path, config).await?).await,
        Command::Chunk(args) => {
            let ctx = open_context(&db_path, config).await?;
            let limit = args.limit.unwrap_or(ctx.config.chunk_size);
            let report = Migrator::new(ctx)
                .run_chunk(args.last_id, limit)
                .await
                .map_err(cli_error)?;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Command::Status { force } => {
            let ctx = open_context(&db_path, config).await?;
            let status = report::migration_status(&ctx, force)
                .await
                .map_err(cli_error)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Report => {
            let ctx = open_context(&db_path, config).await?;
            let corrupt = report::corrupt_media(&ctx).await.map_err(cli_error)?;
            println!("{}", serde_json::to_string_pretty(&corrupt)?);
            Ok(())
        }
        Command::HideNotice => {
            let ctx = open_context(&db_path, config).await?;
            report::hide_notice(&ctx).await.map_err(cli_error)
        }
        Command::Cleanup => {
            let ctx = open_context(&db_path, config).await?;
            let summary = report::cleanup_legacy(&ctx).await.map_err(cli_error)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Serve { addr } => {
            let ctx = open_context(&db_path, config).await?;
            let driver = Arc::new(AjaxDriver::new(Migrator::new(ctx)));
            ajax::serve(driver, addr).await.map_err(cli_error)
        }
    }
}

fn print_token(config: &MigrationConfig) -> Result<()> {
    let secret = config.token_secret.as_deref().ok_or_else(|| {
        anyhow!(
            "No token secret configured; set {} or token_secret in the config file.",
            config::ENV_TOKEN_SECRET
        )
    })?;
    println!("{}", TokenVerifier::new(secret).issue(ajax::ACTION));
    Ok(())
}

async fn open_context(db_path: &Path, config: MigrationConfig) -> Result<MigrationContext> {
    let pool = open_sqlite_pool(db_path, false)
        .await
        .map_err(cli_error)
        .with_context(|| format!("open {}", db_path.display()))?;
    apply_migrations(&pool).await.map_err(cli_error)?;
    Ok(MigrationContext::new(pool, config))
}

async fn run(args: RunArgs, ctx: MigrationContext) -> Result<()> {
    let limit = args.limit.unwrap_or(ctx.config.chunk_size);
    config::validate_chunk_size(limit).map_err(cli_error)?;
    let migrator = Migrator::new(ctx);
    let mut cancelled = false;
    let mut last: Option<ChunkReport> = None;

    while !cancelled {
        let chunk = migrator.run_chunk(None, limit);
        tokio::pin!(chunk);
        let report = loop {
            tokio::select! {
                result = &mut chunk => break result.map_err(cli_error)?,
                signal = signal::ctrl_c(), if !cancelled => {
                    signal.context("install Ctrl+C handler")?;
                    eprintln!("Received interrupt. Finishing current chunk before exiting…");
                    cancelled = true;
                }
            }
        };

        if args.json {
            println!(
                "{}",
                json!({
                    "type": "progress",
                    "done": report.done,
                    "total": report.total,
                    "pending": report.pending,
                    "last_id": report.next_cursor,
                    "stage": report.stage,
                })
            );
        }
        info!(
            target: "mediashift",
            event = "cli_chunk",
            done = report.done,
            total = report.total,
            stage = report.stage.label()
        );
        let completed = report.completed;
        last = Some(report);
        if completed {
            break;
        }
    }

    if let Some(report) = &last {
        if !args.json {
            println!(
                "{}/{} migrated, {} remaining ({})",
                report.done,
                report.total,
                report.pending,
                format_duration(report.pending)
            );
        }
        if !report.completed {
            std::process::exit(130);
        }
    }
    Ok(())
}

fn cli_error(err: AppError) -> anyhow::Error {
    let mut message = format!("{} ({})", err.message(), err.code());
    let mut context: Vec<_> = err.context().iter().collect();
    context.sort();
    for (key, value) in context {
        message.push_str(&format!("\n  {key}: {value}"));
    }
    anyhow!(message)
}
