//! Domain coordinator binary.
//!
//! ```bash
//! waypost-domain --config domain.json
//! ```
//!
//! Exits with status 234 on a fatal configuration error so a supervisor can
//! restart it once the settings are fixed.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waypost_core::{LOCAL_PORT_SEGMENT, TokioProviders};
use waypost_domain::{DomainError, DomainServer, DomainServerConfig};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "waypost-domain")]
#[command(about = "Domain coordinator for a waypost cluster", long_about = None)]
struct Args {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port, overriding the settings file
    #[arg(short, long)]
    port: Option<u16>,
}

async fn run(args: Args) -> Result<(), DomainError> {
    let mut config = match &args.config {
        Some(path) => DomainServerConfig::load(path)?,
        None => DomainServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let mut server = DomainServer::new(TokioProviders::new(), config).await?;
    if let Err(error) = server.publish_local_port(LOCAL_PORT_SEGMENT) {
        warn!(%error, "cannot publish local port, co-located clients will not find us");
    }
    info!(local = %server.local_addr()?, "domain server listening");

    server
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                error!(%error, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,waypost_domain=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(args).await {
        error!(error = %err, "domain server stopped");
        std::process::exit(err.exit_code());
    }
}
