use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use testdeck::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "testdeck")]
#[command(about = "Control plane for scripted browser test runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the run orchestration server
    Serve {
        #[arg(long, env = "TESTDECK_HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(long, env = "TESTDECK_PORT", default_value_t = 3001)]
        port: u16,

        /// SQLite database file
        #[arg(long, env = "TESTDECK_DB", default_value = "testdeck.db")]
        db_path: PathBuf,

        /// Directory containing the runnable scripts
        #[arg(long, env = "TESTDECK_SCRIPTS_DIR", default_value = "scripts")]
        scripts_dir: PathBuf,

        /// Directory screenshots are stored in and served from
        #[arg(long, env = "TESTDECK_ARTIFACTS_DIR", default_value = "screenshots")]
        artifacts_dir: PathBuf,

        /// Upper bound on concurrently executing runner processes
        #[arg(long, default_value_t = 4)]
        max_concurrent_runs: usize,

        /// Seconds a run may execute before it is killed and marked failed
        #[arg(long, default_value_t = 600)]
        run_timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            scripts_dir,
            artifacts_dir,
            max_concurrent_runs,
            run_timeout_secs,
        } => {
            let config = ServerConfig {
                host,
                port,
                db_path,
                scripts_dir,
                artifacts_dir,
                max_concurrent_runs,
                run_timeout: Duration::from_secs(run_timeout_secs),
                ..ServerConfig::default()
            };
            start_server(config).await
        }
    }
}
