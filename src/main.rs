use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bulk_updater::auth::{AuthGate, Credentials};
use bulk_updater::config::{self, Config};
use bulk_updater::crm::{CrmClient, CrmService};
use bulk_updater::db::{self, EntryEdit, Pool};
use bulk_updater::extract::CsvExtractor;
use bulk_updater::jobs;
use bulk_updater::model::TargetKind;
use bulk_updater::pipeline::Pipeline;
use bulk_updater::report::ReportKind;
use bulk_updater::session::SessionService;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, ClapArgs)]
struct Caller {
    /// Shared secret checked by the auth gate
    #[arg(long)]
    token: String,
    /// Portal domain the caller acts for
    #[arg(long)]
    domain: Option<String>,
}

impl Caller {
    fn credentials(&self) -> Credentials {
        Credentials::new(self.token.clone(), self.domain.clone())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run background workers until Ctrl-C
    Worker,
    /// Run every queued job once and exit
    Drain,
    /// Upload a CSV/TSV file and create a session
    Upload {
        #[command(flatten)]
        caller: Caller,
        file: PathBuf,
    },
    /// Pick target and key columns and queue matching
    Start {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
        /// contacts, companies or both
        #[arg(long, value_parser = parse_target)]
        target: TargetKind,
        /// Key columns in priority order
        #[arg(long = "key", required = true, value_delimiter = ',')]
        keys: Vec<String>,
    },
    /// Session status, entry counts and batches
    Status {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
    },
    /// List the pending changes of a session
    Entries {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
    },
    /// Apply edits from a JSON array of {id, action?, new_value?, selected?}
    Edit {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
        edits: PathBuf,
    },
    /// Select or deselect every matched entry
    SelectAll {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
        #[arg(long)]
        deselect: bool,
    },
    /// Queue execution of the selected (or listed) entries
    Execute {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
        #[arg(long = "entries", value_delimiter = ',')]
        entries: Option<Vec<i64>>,
    },
    /// Queue an undo of a completed session
    Undo {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
    },
    /// Export not_found, duplicates or errors as CSV
    Report {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
        #[arg(value_parser = parse_report_kind)]
        kind: ReportKind,
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete a session with its entries, batches and queued jobs
    Delete {
        #[command(flatten)]
        caller: Caller,
        session_id: String,
    },
    /// Print an example config.yaml
    ExampleConfig,
}

fn parse_target(s: &str) -> Result<TargetKind, String> {
    TargetKind::parse_state(s).ok_or_else(|| format!("unknown target {:?}", s))
}

fn parse_report_kind(s: &str) -> Result<ReportKind, String> {
    ReportKind::parse_state(s).ok_or_else(|| format!("unknown report {:?}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Worker => run_workers(&cfg, pool).await,
        Command::Drain => {
            let pipeline = build_pipeline(&cfg, pool)?;
            let processed = jobs::drain(&pipeline, &CancellationToken::new()).await?;
            print_json(&serde_json::json!({ "processed": processed }))
        }
        command => run_request(&cfg, pool, command).await,
    }
}

fn build_pipeline(cfg: &Config, pool: Pool) -> Result<Pipeline> {
    let limiter = CrmClient::shared_limiter(&cfg.crm);
    let crm: Arc<dyn CrmService> = Arc::new(CrmClient::from_config(&cfg.crm, limiter)?);
    Ok(Pipeline::new(pool, crm, cfg.crm.batch_size))
}

async fn run_workers(cfg: &Config, pool: Pool) -> Result<()> {
    // One client and limiter shared by every loop keeps the call spacing global.
    let pipeline = build_pipeline(cfg, pool)?;
    let poll = Duration::from_millis(cfg.app.poll_interval_ms);
    let cancel = CancellationToken::new();

    let mut handles = Vec::with_capacity(cfg.app.workers);
    for _ in 0..cfg.app.workers.max(1) {
        handles.push(tokio::spawn(jobs::run_worker(
            pipeline.clone(),
            poll,
            cancel.clone(),
        )));
    }
    info!(workers = handles.len(), "workers started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            error!(?err, "worker task panicked");
        }
    }
    Ok(())
}

async fn run_request(cfg: &Config, pool: Pool, command: Command) -> Result<()> {
    let service = SessionService::new(
        pool,
        AuthGate::from_config(&cfg.auth),
        Arc::new(CsvExtractor),
        cfg.limits.clone(),
    );

    match command {
        Command::Upload { caller, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let name = file_name(&file)?;
            let session = service
                .create_session(&caller.credentials(), &name, &bytes)
                .await?;
            print_json(&session)
        }
        Command::Start {
            caller,
            session_id,
            target,
            keys,
        } => {
            service
                .start_matching(&caller.credentials(), &session_id, target, &keys)
                .await?;
            print_json(&serde_json::json!({ "session_id": session_id, "queued": "match" }))
        }
        Command::Status { caller, session_id } => {
            print_json(&service.status(&caller.credentials(), &session_id).await?)
        }
        Command::Entries { caller, session_id } => {
            print_json(&service.entries(&caller.credentials(), &session_id).await?)
        }
        Command::Edit {
            caller,
            session_id,
            edits,
        } => {
            let raw = tokio::fs::read_to_string(&edits)
                .await
                .with_context(|| format!("reading {}", edits.display()))?;
            let edits: Vec<EntryEdit> = serde_json::from_str(&raw).context("parsing edits")?;
            let applied = service
                .apply_edits(&caller.credentials(), &session_id, &edits)
                .await?;
            print_json(&serde_json::json!({ "applied": applied }))
        }
        Command::SelectAll {
            caller,
            session_id,
            deselect,
        } => {
            let changed = service
                .select_all(&caller.credentials(), &session_id, !deselect)
                .await?;
            print_json(&serde_json::json!({ "changed": changed }))
        }
        Command::Execute {
            caller,
            session_id,
            entries,
        } => {
            let ids = service
                .start_execution(&caller.credentials(), &session_id, entries.as_deref())
                .await?;
            print_json(&serde_json::json!({ "queued": "execute", "entries": ids }))
        }
        Command::Undo { caller, session_id } => {
            service.start_undo(&caller.credentials(), &session_id).await?;
            print_json(&serde_json::json!({ "session_id": session_id, "queued": "undo" }))
        }
        Command::Report {
            caller,
            session_id,
            kind,
            out,
        } => {
            let csv = service
                .report(&caller.credentials(), &session_id, kind)
                .await?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, csv).await?;
                    print_json(&serde_json::json!({ "written": path }))
                }
                None => {
                    print!("{}", csv);
                    Ok(())
                }
            }
        }
        Command::Delete { caller, session_id } => {
            service
                .delete_session(&caller.credentials(), &session_id)
                .await?;
            print_json(&serde_json::json!({ "deleted": session_id }))
        }
        Command::Worker | Command::Drain | Command::ExampleConfig => Ok(()),
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
