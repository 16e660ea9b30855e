//! The request/response channel between caches and storage nodes (and back,
//! for revoke callbacks): length-delimited JSON frames over TCP, with a
//! multiplexing client and a task-per-connection server.
//!
//! The channel is best-effort: it never retries internally, and a lost
//! connection surfaces as [`Error::Disconnected`] on every pending call.

mod client;
mod server;

pub use client::Client;
pub use server::Server;

use storage_proto::Request;

/// Handlers receive every decoded request of a connection concurrently;
/// slow requests (a write stalled in revocation, say) never delay others.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request) -> anyhow::Result<serde_json::Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to dial {addr}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind listener")]
    Bind(#[source] std::io::Error),
    #[error("connection lost")]
    Disconnected,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("failed to encode request")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode response")]
    Decode(#[source] serde_json::Error),
}

/// One request on the wire. Ids are per-connection and chosen by the
/// client; responses may return in any order.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct RequestFrame {
    id: u64,
    #[serde(flatten)]
    request: Request,
}

/// One response on the wire: `{"id": .., "ok": ..}` or `{"id": .., "error": ..}`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ResponseFrame {
    id: u64,
    #[serde(flatten)]
    outcome: Outcome,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum Outcome {
    #[serde(rename = "ok")]
    Ok(serde_json::Value),
    #[serde(rename = "error")]
    Err(String),
}

/// Frame size covers any plausible value or ring; oversize frames indicate
/// a broken peer and fail the connection.
const MAX_FRAME: usize = 1 << 20;

fn codec() -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME)
        .new_codec()
}
