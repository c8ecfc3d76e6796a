//! Assignment client binary.
//!
//! ```bash
//! # take anything from a local coordinator, following its port
//! waypost-assignment-client --port-discovery
//!
//! # only agents from the "numerics" pool
//! waypost-assignment-client --type agent --pool numerics --domain 10.0.0.5:40102
//! ```

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use waypost_assignment::{AssignmentClient, ClientConfig, ClientError};
use waypost_core::{AssignmentType, LOCAL_PORT_SEGMENT, NetworkProvider, Providers, TokioProviders};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "waypost-assignment-client")]
#[command(about = "Runs assignments handed out by a waypost domain server", long_about = None)]
struct Args {
    /// Assignment type to request
    #[arg(short = 't', long = "type", default_value = "all")]
    assignment_type: AssignmentType,

    /// Pool to serve
    #[arg(long, default_value = "")]
    pool: String,

    /// Wallet credited for the work
    #[arg(long)]
    wallet: Option<Uuid>,

    /// Domain server address
    #[arg(short, long, default_value = "127.0.0.1:40102")]
    domain: String,

    /// Follow the port published by a domain server on this host
    #[arg(long)]
    port_discovery: bool,
}

async fn run(args: Args) -> Result<(), ClientError> {
    let providers = TokioProviders::new();
    let domain = providers
        .network()
        .resolve(&args.domain)
        .await
        .map_err(|source| ClientError::Resolve {
            host: args.domain.clone(),
            source,
        })?;

    let config = ClientConfig {
        assignment_type: args.assignment_type,
        pool: args.pool,
        wallet_uuid: args.wallet,
        port_segment: args.port_discovery.then(|| LOCAL_PORT_SEGMENT.to_string()),
        ..ClientConfig::new(domain)
    };
    let client = AssignmentClient::new(providers, config).await?;

    client
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                error!(%error, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    info!("assignment client stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,waypost_assignment=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(args).await {
        error!(error = %err, "assignment client failed");
        std::process::exit(1);
    }
}
