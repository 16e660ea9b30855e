use anyhow::Context;
use clap::{Parser, Subcommand};
use libstore::{LeaseMode, Libstore};

/// Command-line client for a storage cluster.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Master storage node address.
    #[arg(long, default_value = "127.0.0.1:9009", env = "STORAGE_MASTER")]
    master: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read a key's value.
    Get { key: String },
    /// Write a key's value.
    Put { key: String, value: String },
    /// Read a key's list.
    GetList { key: String },
    /// Append an item to a key's list.
    Append { key: String, item: String },
    /// Remove an item from a key's list.
    Remove { key: String, item: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let store = Libstore::new(&cli.master, None, LeaseMode::Normal)
        .await
        .context("failed to reach the storage cluster")?;

    match cli.command {
        Command::Get { key } => {
            println!("{}", store.get(&key).await?);
        }
        Command::Put { key, value } => {
            store.put(&key, &value).await?;
        }
        Command::GetList { key } => {
            for item in store.get_list(&key).await? {
                println!("{item}");
            }
        }
        Command::Append { key, item } => {
            store.append_to_list(&key, &item).await?;
        }
        Command::Remove { key, item } => {
            store.remove_from_list(&key, &item).await?;
        }
    }
    Ok(())
}
