use clap::Parser;
use llm_gateway::app::{AppState, RouterOptions};
use llm_gateway::config::ConfigStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Failover reverse-proxy gateway for chat-completion upstreams.
#[derive(Debug, Parser)]
#[command(name = "llm-gateway", about = "Forwards protocol-O/protocol-A chat requests with health-weighted failover")]
struct Cli {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Host/address to bind to.
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Directory holding providers.json/groups.json/keys.json/stats.json.
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory for daily trace logs. Defaults to <config-dir>/logs.
    #[arg(short = 'l', long)]
    log_dir: Option<PathBuf>,

    /// Disable the permissive CORS layer.
    #[arg(long)]
    no_cors: bool,

    /// Directory of static admin-UI assets to serve at `/`.
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config_dir = cli
        .config_dir
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("data"));
    let log_dir = cli.log_dir.unwrap_or_else(|| config_dir.join("logs"));

    let config = ConfigStore::load(&config_dir)?;
    let state = Arc::new(AppState::new(config, log_dir)?);

    let router = llm_gateway::app::build_router(
        state,
        RouterOptions {
            cors_enabled: !cli.no_cors,
            static_dir: cli.static_dir,
        },
    );

    let addr = format!("{}:{}", cli.host, cli.port);
    tracing::info!(%addr, "starting gateway");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
