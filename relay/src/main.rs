use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tunnel_relay::{build_app, DEFAULT_DOMAIN, DEFAULT_PORT};

/// The public relay: accepts tunnel clients on `/tunnel` and forwards
/// public HTTP traffic to them by subdomain.
#[derive(Parser, Debug)]
#[command(name = "tunnel-relay", about = "Reverse HTTP tunnel relay")]
struct Cli {
    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Public base domain tunnels are minted under.
    #[arg(long)]
    domain: Option<String>,
}

impl Cli {
    fn resolved_port(&self) -> u16 {
        self.port
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .or_else(|| {
                std::env::var("RELAY_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(DEFAULT_PORT)
    }

    fn resolved_domain(&self) -> String {
        self.domain
            .clone()
            .or_else(|| std::env::var("RELAY_DOMAIN").ok())
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_relay=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let port = cli.resolved_port();
    let domain = cli.resolved_domain();

    let (app, state) = build_app(domain.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("relay listening on {addr} (domain: {domain})");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let shutdown = state.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down, cancelling in-flight requests");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}
