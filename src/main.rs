use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};

use killtracker::config::{self, AppState};
use killtracker::tasks;

#[derive(Parser)]
#[command(name = "killtracker", about = "Killmail feed tracker with webhook alerts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon (periodic ingest + retention purge)
    Run,
    /// Run one ingest cycle and exit
    IngestOnce,
    /// Send a test message to a webhook, optionally built from a historical killmail
    SendTest {
        webhook_id: u64,
        killmail_id: Option<i64>,
    },
    /// Delete archived killmails past the configured retention
    PurgeStale,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let app_config = match config::load_app_config() {
        Ok(app_config) => app_config,
        Err(e) => {
            error!("Failed to load application configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let state = match AppState::new(app_config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to open storage: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Run => {
            tasks::run_scheduler(state).await;
            ExitCode::SUCCESS
        }
        Command::IngestOnce => {
            // A busy ingest lock is a clean outcome: another worker has the run.
            match tasks::run_ingest(&state).await {
                tasks::IngestOutcome::Completed { received } => {
                    info!("Done, {} killmails received", received);
                }
                tasks::IngestOutcome::LockBusy => {}
            }
            ExitCode::SUCCESS
        }
        Command::SendTest {
            webhook_id,
            killmail_id,
        } => match tasks::send_test(&state, webhook_id, killmail_id).await {
            Ok(()) => {
                info!("Test message delivered to webhook {}", webhook_id);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Test message failed: {}", e);
                ExitCode::FAILURE
            }
        },
        Command::PurgeStale => {
            tasks::purge_stale(&state).await;
            ExitCode::SUCCESS
        }
    }
}
