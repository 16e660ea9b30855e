use anyhow::Context;
use clap::Parser;
use storage::{cluster, LeaseTerms, StorageService};
use storage_proto::Node;

/// A storage node. Without `--master` this node is the master and waits for
/// `--cluster-size` registrations; with it, the node registers until the
/// cluster is ready.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Address to listen on for storage RPCs.
    #[arg(long, default_value = "127.0.0.1:9009", env = "STORAGE_LISTEN")]
    listen: std::net::SocketAddr,
    /// Address peers should use to reach this node; defaults to --listen.
    #[arg(long, env = "STORAGE_ADVERTISE")]
    advertise: Option<String>,
    /// Master address to register with; absent means this node is the master.
    #[arg(long, env = "STORAGE_MASTER")]
    master: Option<String>,
    /// Expected ring size, counted by the master.
    #[arg(long, default_value = "1", env = "STORAGE_CLUSTER_SIZE")]
    cluster_size: usize,
    /// Ring position; random when unset.
    #[arg(long, env = "STORAGE_NODE_ID")]
    node_id: Option<u32>,
    /// Registration attempts (one per second) before giving up.
    #[arg(long, default_value = "10")]
    join_attempts: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let node_id = cli.node_id.unwrap_or_else(rand::random);
    let advertise = cli
        .advertise
        .clone()
        .unwrap_or_else(|| cli.listen.to_string());
    let self_node = Node {
        host_port: advertise,
        node_id,
    };

    let service = match &cli.master {
        None => StorageService::master(
            node_id,
            cli.cluster_size,
            self_node.clone(),
            LeaseTerms::default(),
        ),
        Some(_) => StorageService::replica(node_id, LeaseTerms::default()),
    };
    let server = rpc::Server::bind(cli.listen, service.clone())
        .await
        .context("failed to bind storage listener")?;
    tracing::info!(addr = %server.local_addr(), node_id, master = cli.master.is_none(), "storage node up");

    if let Some(master) = &cli.master {
        let servers = cluster::join(master, self_node, cli.join_attempts)
            .await
            .context("cluster formation failed")?;
        service.install_ring(servers);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}
