use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aemsync-cli")]
#[command(about = "Pull platform/well data from the AEM API into the local database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every configured endpoint and reconcile it into the database.
    Sync {
        /// Endpoint to sync; repeatable. Defaults to AEM_ENDPOINTS or endpoints.yaml.
        #[arg(long = "endpoint", value_name = "NAME")]
        endpoints: Vec<String>,
        /// Reconcile into memory and report, without touching the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Normalize a saved payload file and print what would be reconciled.
    Inspect { file: PathBuf },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli.command.unwrap_or(Commands::Sync {
        endpoints: Vec::new(),
        dry_run: false,
    }))
    .await
    {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "aemsync-cli failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Sync { endpoints, dry_run } => {
            let summary = aemsync_sync::run_sync_once_from_env(aemsync_sync::SyncOptions {
                endpoints,
                dry_run,
            })
            .await?;
            let outcome = &summary.outcome;
            println!(
                "sync complete: run_id={} endpoints={} platforms(+{} ~{} ={}) wells(+{} ~{} ={}) rejected={} failed_endpoints={} rows={}",
                summary.run_id,
                summary.endpoints.len(),
                outcome.platforms_added,
                outcome.platforms_updated,
                outcome.platforms_unchanged,
                outcome.wells_added,
                outcome.wells_updated,
                outcome.wells_unchanged,
                outcome.rejected(),
                outcome.endpoints_failed,
                outcome.rows_committed,
            );
            for line in &outcome.errors {
                eprintln!("  {line}");
            }
            Ok(if outcome.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Commands::Migrate => {
            aemsync_sync::migrate_from_env().await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Inspect { file } => {
            let normalized = aemsync_adapters::load_payload_file(&file)?;
            let rendered = serde_json::to_string_pretty(&normalized)
                .with_context(|| format!("rendering {}", file.display()))?;
            println!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
    }
}
