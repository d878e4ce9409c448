use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drover::config::ServerConfig;
use drover::sched::LocalScheduler;
use drover::server::Server;
use drover::store::MemStore;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "A job queue broker that feeds command-line jobs to runners")]
struct Args {
    /// Port to listen on for client connections
    #[arg(long, default_value = "11301")]
    port: u16,

    /// Name of the job queue
    #[arg(long, default_value = "cmds")]
    queue: String,

    /// Runner command template with {queue} and {group} placeholders;
    /// empty means runners are started manually
    #[arg(long, default_value = "")]
    runner_cmd: String,

    /// File to write the generated auth token to
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Restore state from a backup file produced by the backup method
    #[arg(long)]
    restore: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = match &args.restore {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            let store = MemStore::from_backup(&bytes)?;
            tracing::info!(path = %path.display(), "restored state from backup");
            store
        }
        None => MemStore::new(),
    };

    let config = ServerConfig {
        port: args.port,
        queue_name: args.queue,
        runner_cmd: args.runner_cmd,
        ..Default::default()
    };

    let server = Server::serve(config, Arc::new(store), Arc::new(LocalScheduler::new())).await?;

    if let Some(path) = &args.token_file {
        std::fs::write(path, server.token())?;
        tracing::info!(path = %path.display(), "auth token written");
    }

    let cause = server.block().await;
    tracing::info!(cause = %cause, "server stopped");
    Ok(())
}
