use agenthub_gateway::config::{self, GatewayConfig};
use agenthub_gateway::manager::EngineManager;
use agenthub_gateway::server::{GatewayServer, TokenValidator};
use agenthub_gateway::store::SessionStore;
use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agenthub-gateway", version, about = "Unified gateway for coding-agent backends")]
struct Args {
    /// Path to the YAML config (defaults to the platform config dir).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Log filter, e.g. `info` or `agenthub_engines=debug,info`.
    #[arg(long, default_value = "info", env = "AGENTHUB_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };
    let mut cfg: GatewayConfig = config::load_config(&config_path)?;
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }

    let data_dir = match &cfg.data_dir {
        Some(dir) => dir.clone(),
        None => config::default_data_dir()?,
    };
    let store = SessionStore::load(data_dir.join("sessions"))
        .with_context(|| format!("load session store under {}", data_dir.display()))?;

    let manager = EngineManager::new(Arc::clone(&store));
    for (name, engine_cfg) in &cfg.engines {
        tracing::info!(engine = %name, "registering engine");
        manager.register(config::build_adapter(name, engine_cfg));
    }
    manager.restore_from_store();
    manager.start_all().await;

    let validator: Option<TokenValidator> = cfg.auth_token.clone().map(|expected| {
        Arc::new(move |token: &str| token == expected) as TokenValidator
    });

    let shutdown = CancellationToken::new();
    let server = GatewayServer::new(
        Arc::clone(&manager),
        cfg.ws_path.clone(),
        validator,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_token.cancel();
        }
    });

    server.serve(listener).await?;

    // Connections are closed; wind the engines down and persist.
    manager.stop_all().await;
    store.flush_all();
    tracing::info!("gateway stopped");
    Ok(())
}
