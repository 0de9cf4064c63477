use anyhow::Context;
use clap::Parser;
use shardgate::{router, Config, Gateway};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Tenant-isolating reverse proxy for columnar database clusters")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shardgate=info,tower_http=warn")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    tracing::info!(
        listen = %config.listen_addr,
        header = %config.header_name,
        max_concurrent = config.max_concurrent,
        max_queue = config.max_queue,
        replicas = config.replicas.len(),
        nodes = config.nodes.len(),
        version = %config.version,
        "configuration loaded"
    );

    let gateway = Arc::new(Gateway::new(&config)?);
    let app = router(gateway);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "shardgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "failed to install the shutdown handler"),
    }
}
