use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use lsp::{Client, Params};

/// Echo client: sends each argument as one message and prints the echoes.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Echo server address.
    #[arg(long, default_value = "127.0.0.1:9999", env = "ECHO_SERVER")]
    server: std::net::SocketAddr,
    /// Epoch interval driving retransmission and liveness.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    epoch: std::time::Duration,
    /// Quiet epochs after which the server is declared lost.
    #[arg(long, default_value = "5")]
    epoch_limit: u32,
    /// Messages to send.
    #[arg(required = true)]
    messages: Vec<String>,
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
    let mut client = Client::connect(cli.server, params)
        .await
        .context("failed to connect")?;
    tracing::info!(conn_id = client.conn_id(), "connected");

    for message in &cli.messages {
        client
            .write(Bytes::from(message.clone()))
            .await
            .context("write failed")?;
    }
    for _ in 0..cli.messages.len() {
        let echo = client.read().await.context("connection lost")?;
        println!("{}", String::from_utf8_lossy(&echo));
    }
    client.close().await;
    Ok(())
}
