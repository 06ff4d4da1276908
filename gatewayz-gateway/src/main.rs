//! Gateway server binary.

use clap::Parser;
use gatewayz_gateway::config::Config;
use gatewayz_gateway::server::create_server;
use gatewayz_gateway::storage::MemoryStorage;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "gatewayz-gateway")]
#[command(about = "LLM API gateway with multi-provider routing and credit metering")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the configured bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. "info" or "gatewayz_gateway=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        tracing::warn!(path = %args.config, "config file not found, using defaults");
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        config
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // The in-memory store backs local development; production deployments
    // wire the relational data-access layer behind the same trait.
    let storage = Arc::new(MemoryStorage::new());

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let app = create_server(config, storage).await?;

    tracing::info!("starting gatewayz gateway on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
