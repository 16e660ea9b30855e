use anyhow::Context;
use clap::Parser;
use lsp::{Event, Params, Server};

/// Echo server: every payload received on a connection is written back on
/// the same connection.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9999", env = "ECHO_LISTEN")]
    listen: std::net::SocketAddr,
    /// Epoch interval driving retransmission and liveness.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    epoch: std::time::Duration,
    /// Quiet epochs after which a peer is declared lost.
    #[arg(long, default_value = "5")]
    epoch_limit: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let params = Params {
        epoch: cli.epoch,
        epoch_limit: cli.epoch_limit,
    };
    let mut server = Server::bind(cli.listen, params)
        .await
        .context("failed to start echo server")?;

    while let Some(event) = server.read().await {
        match event {
            Event::Data(conn_id, payload) => {
                tracing::info!(conn_id, len = payload.len(), "echoing");
                if let Err(error) = server.write(conn_id, payload).await {
                    tracing::warn!(conn_id, %error, "echo write failed");
                }
            }
            Event::Closed(conn_id) => {
                tracing::info!(conn_id, "connection closed");
            }
        }
    }
    Ok(())
}
