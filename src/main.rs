// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use ethers::types::Address;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gasless_facilitator::api::{self, AccountAbstraction, AppState};
use gasless_facilitator::builder::OperationBuilder;
use gasless_facilitator::bundler::BundlerClient;
use gasless_facilitator::chain::{EthersEntryPoint, EthersRateFeed};
use gasless_facilitator::content::FortuneClient;
use gasless_facilitator::negotiator::PaymentNegotiator;
use gasless_facilitator::oracle::{PriceOracleCache, SystemClock, FEED_TIMEOUT, JPY_USD_FEED_ADDRESS};
use gasless_facilitator::relayer::MetaTxRelayer;
use gasless_facilitator::submitter::OperationSubmitter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "FACILITATOR_BIND_ADDR", default_value = "127.0.0.1:3000")]
    bind_addr: String,

    /// Gas-paying key for ERC-3009 relays; relaying is disabled without it.
    #[clap(long, env = "FACILITATOR_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Pimlico key; account-abstraction routes are disabled without it.
    #[clap(long, env = "PAYMASTER_PIMLICO_API_KEY", hide_env_values = true)]
    bundler_api_key: Option<String>,

    /// Overrides the Pimlico URL derived from the API key.
    #[clap(long, env = "BUNDLER_URL")]
    bundler_url: Option<String>,

    #[clap(long, env = "ENTRY_POINT_RPC_URL", default_value = "https://sepolia.base.org")]
    entry_point_rpc_url: String,

    #[clap(long, env = "ORACLE_RPC_URL", default_value = "https://ethereum-rpc.publicnode.com")]
    oracle_rpc_url: String,

    #[clap(
        long,
        env = "GACHA_RECIPIENT_ADDRESS",
        default_value = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"
    )]
    recipient: String,

    #[clap(long, env = "FORTUNE_API_KEY", hide_env_values = true)]
    fortune_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command line arguments
    let args = Args::parse();
    let cancel = CancellationToken::new();

    let state = build_state(&args, cancel.clone())?;
    let app = api::router(Arc::new(state));

    let server_addr: SocketAddr = args.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(server_addr).await?;
    info!("Starting gasless payment facilitator on {}", server_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Stop receipt polling so open requests answer `pending`
            shutdown.cancel();
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

fn build_state(args: &Args, cancel: CancellationToken) -> anyhow::Result<AppState> {
    let relayer = match args.private_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => MetaTxRelayer::connect(key)?,
        None => {
            warn!("FACILITATOR_PRIVATE_KEY not set, ERC-3009 relaying disabled");
            MetaTxRelayer::unconfigured()
        }
    };

    let bundler_url = match (&args.bundler_url, args.bundler_api_key.as_deref()) {
        (Some(url), _) => Some(url.clone()),
        (None, Some(key)) if !key.is_empty() => Some(BundlerClient::pimlico_url(key)),
        _ => None,
    };
    let account_abstraction = match bundler_url {
        Some(url) => {
            let bundler = Arc::new(BundlerClient::new(&url)?);
            let entry_point = Arc::new(EthersEntryPoint::new(&args.entry_point_rpc_url)?);
            Some(AccountAbstraction {
                builder: OperationBuilder::new(bundler.clone(), entry_point),
                submitter: OperationSubmitter::new(bundler, cancel),
            })
        }
        None => {
            warn!("Bundler API key not configured, account-abstraction routes disabled");
            None
        }
    };

    let feed = EthersRateFeed::new(&args.oracle_rpc_url, JPY_USD_FEED_ADDRESS, FEED_TIMEOUT)?;
    let oracle = PriceOracleCache::new(Arc::new(feed), Arc::new(SystemClock));

    let recipient: Address = args
        .recipient
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid recipient address {}: {:?}", args.recipient, e))?;
    info!("Payments are collected by {:?}", recipient);

    Ok(AppState {
        relayer,
        account_abstraction,
        negotiator: PaymentNegotiator::new(Arc::new(oracle), recipient),
        content: Arc::new(FortuneClient::new(args.fortune_api_key.clone())?),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
