use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use cocode_collab::config::CollabConfig;
use cocode_collab::server::{CollabServer, ServerError};
use log::{error, info, warn};

/// Shared C++ editor server.
#[derive(Debug, Parser)]
#[command(name = "cocode-server", version, about)]
struct Args {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.bind_addr`
    #[arg(short, long)]
    bind: Option<String>,
}

async fn run(args: Args) -> Result<(), ServerError> {
    let mut config = match &args.config {
        Some(path) => CollabConfig::load(path)?,
        None => CollabConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if config.auth.tokens.is_empty() {
        warn!("No session tokens configured; every connection will be refused");
    }

    let server = CollabServer::new(config);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting cocode server...");
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
