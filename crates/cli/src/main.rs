//! Spendgate CLI — the main entry point.
//!
//! Commands:
//! - `onboard`   — Initialize config directory & default policy file
//! - `serve`     — Start the admission gateway (with the expiry sweeper)
//! - `sweep`     — Run one reclaim sweep and exit
//! - `reconcile` — Audit reserved balances against active holds
//! - `scope`     — Inspect one scope's current-period balances

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "spendgate",
    about = "Spendgate — budget admission control for LLM gateways",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and the ledger directory
    Onboard,

    /// Start the admission gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one expiry sweep cycle and exit
    Sweep,

    /// Audit reserved balances against the reservation table
    Reconcile {
        /// Heal drifted scope rows from the reservation table
        #[arg(long)]
        fix: bool,
    },

    /// Show a scope's current-period balances
    Scope {
        /// Scope type: "key" or "team"
        kind: String,
        /// Scope identifier
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Sweep => commands::sweep::run().await?,
        Commands::Reconcile { fix } => commands::reconcile::run(fix).await?,
        Commands::Scope { kind, id } => commands::scope::run(&kind, &id).await?,
    }

    Ok(())
}
