use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pop_reconcile::config::{self, AppConfig};
use pop_reconcile::extraction_api::HttpExtractionClient;
use pop_reconcile::pipeline::reconcile::{
    start_background_reconciler, DocumentState, RecordSource, Reconciler, SqliteStateStore,
    StateStore,
};
use pop_reconcile::remote::SqliteRecordSource;

#[derive(Parser, Debug)]
#[command(
    name = "pop-reconcile",
    version = config::APP_VERSION,
    about = "Track and reconcile Proof of Prior documents against the underwriting database"
)]
struct Cli {
    /// Config file (JSON). Defaults to ~/PopReconcile/config.json.
    #[arg(long, env = "POP_RECONCILE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one reconciliation cycle and print its report.
    Cycle,
    /// Run cycles until the process is stopped.
    Watch {
        /// Seconds between cycles; overrides cycle_interval_secs.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// List tracked documents.
    List {
        /// Only documents in this state (e.g. pending, awaiting_approval).
        #[arg(long)]
        state: Option<String>,
    },
    /// Count tracked documents per state.
    Status,
    /// Print one tracked document as JSON.
    Show { document_id: String },
    /// Print the state transitions of one document.
    History { document_id: String },
    /// Approve a document held in awaiting_approval.
    Approve { document_id: String },
    /// Put a failed document back to pending.
    Reset { document_id: String },
    /// List candidate rows currently visible in the remote database.
    RemoteList,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    let log_path = pop_reconcile::init_tracing(config.log_dir.as_deref()).context("Failed to open log file")?;
    if let Some(path) = log_path {
        tracing::debug!(path = %path.display(), "Logging to file");
    }

    match cli.command {
        Command::Cycle => {
            let reconciler = build_reconciler(&config)?;
            let report = reconciler.run_cycle(&AtomicBool::new(false));
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Watch { interval_secs } => {
            let interval = Duration::from_secs(interval_secs.unwrap_or(config.pipeline.cycle_interval_secs));
            let reconciler = Arc::new(build_reconciler(&config)?);
            tracing::info!("{} v{} watching", config::APP_NAME, config::APP_VERSION);
            start_background_reconciler(reconciler, interval).join();
        }
        Command::List { state } => {
            let store = open_store(&config)?;
            let records = match state {
                Some(s) => {
                    let state = DocumentState::from_str(&s)
                        .with_context(|| format!("Unknown state '{s}'"))?;
                    store.get_by_state(state)?
                }
                None => store.list_all()?,
            };
            for r in &records {
                println!(
                    "{:<12} {:<18} {:<10} attempts={} updated={}  {}",
                    r.document_id,
                    r.state.as_str(),
                    r.match_result.map(|m| m.as_str()).unwrap_or("-"),
                    r.attempt_count,
                    r.updated_at,
                    r.last_error.as_deref().unwrap_or(""),
                );
            }
            println!("{} record(s)", records.len());
        }
        Command::Status => {
            let store = open_store(&config)?;
            for (state, count) in store.count_by_state()? {
                println!("{state:<18} {count}");
            }
        }
        Command::Show { document_id } => {
            let store = open_store(&config)?;
            let Some(record) = store.get(&document_id)? else {
                bail!("No tracked document {document_id}");
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::History { document_id } => {
            let store = open_store(&config)?;
            for entry in store.transitions_for(&document_id)? {
                println!(
                    "{}  {:<18} -> {:<18} {}",
                    entry.at,
                    entry.from_state.map(|s| s.as_str()).unwrap_or("-"),
                    entry.to_state.as_str(),
                    entry.note.as_deref().unwrap_or(""),
                );
            }
        }
        Command::Approve { document_id } => {
            let store = open_store(&config)?;
            if !store.approve(&document_id)? {
                bail!("{document_id} is not awaiting approval");
            }
            println!("Approved {document_id}; it will be written back on the next cycle");
        }
        Command::Reset { document_id } => {
            let store = open_store(&config)?;
            if !store.reset_failed(&document_id)? {
                bail!("{document_id} is not in the failed state");
            }
            println!("Reset {document_id} to pending");
        }
        Command::RemoteList => {
            let remote = open_remote(&config)?;
            let rows = remote.find_candidates(&config.pipeline.candidate_query())?;
            for row in &rows {
                println!(
                    "{:<12} {:<10} {}  {}  {}",
                    row.file_id,
                    row.policy_id.as_deref().unwrap_or("-"),
                    row.created_at,
                    row.file_path,
                    row.task_comment,
                );
            }
            println!("{} candidate row(s)", rows.len());
        }
    }

    Ok(())
}

fn open_store(config: &AppConfig) -> Result<SqliteStateStore> {
    let path = config.state_db_path()?;
    SqliteStateStore::open(&path).with_context(|| format!("Failed to open state store {}", path.display()))
}

fn open_remote(config: &AppConfig) -> Result<SqliteRecordSource> {
    let path = config.remote_db_path()?;
    SqliteRecordSource::open(path, config.pipeline.remote_timeout())
        .with_context(|| format!("Failed to open remote database {}", path.display()))
}

fn build_reconciler(config: &AppConfig) -> Result<Reconciler> {
    let store = open_store(config)?;
    let remote = open_remote(config)?;
    let api_key = config::api_key_from_env();
    if api_key.is_none() {
        tracing::warn!("{} is not set; extraction requests are unauthenticated", config::API_KEY_ENV);
    }
    let client = HttpExtractionClient::new(config.extraction_endpoint()?, api_key, config.documents_root.clone())
        .context("Failed to build extraction client")?;

    Ok(Reconciler::new(
        Arc::new(store),
        Arc::new(remote),
        Arc::new(client),
        config.pipeline.clone(),
    )?)
}
