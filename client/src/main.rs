use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tunnel_client::handlers::StaticFileHandler;
use tunnel_client::tunnel::TunnelClient;

const DEFAULT_RELAY_URL: &str = "wss://filegate.app/tunnel";

/// Exposes a local directory through a reverse tunnel.
#[derive(Parser, Debug)]
#[command(name = "tunnel-client", about = "Reverse HTTP tunnel client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a relay and serve a local directory through it.
    Serve {
        /// Directory to serve.
        #[arg(long, default_value = ".")]
        root: String,

        /// Relay WebSocket URL.
        #[arg(long, default_value = DEFAULT_RELAY_URL)]
        relay: String,

        /// Basic Auth username.
        #[arg(long, default_value = "tunnel")]
        user: String,

        /// Basic Auth password. A random one is generated if omitted.
        #[arg(long)]
        pass: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_client=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            root,
            relay,
            user,
            pass,
        } => serve(root, relay, user, pass).await,
    }
}

async fn serve(root: String, relay: String, user: String, pass: Option<String>) -> Result<()> {
    let password = pass.unwrap_or_else(generate_password);
    println!("Basic Auth: {user} / {password}");

    let handler = Arc::new(StaticFileHandler::new(root.clone(), user, password));
    let client = TunnelClient::new(relay.clone(), handler);

    info!("serving {root} through {relay}");
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_cancel.cancel();
    });

    client.connect(cancel).await?;
    Ok(())
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
