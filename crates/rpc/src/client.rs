use crate::{codec, Error, Outcome, RequestFrame, ResponseFrame};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use storage_proto::Request;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// A dialed connection to one peer. Cheap to clone; all clones share the
/// underlying stream, over which any number of calls may be in flight
/// concurrently (responses are matched to callers by request id).
#[derive(Clone)]
pub struct Client {
    calls: mpsc::Sender<Call>,
}

struct Call {
    request: Request,
    reply: oneshot::Sender<Result<serde_json::Value, Error>>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, Error>>>>>;

impl Client {
    pub async fn dial(addr: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await.map_err(|source| Error::Dial {
            addr: addr.to_string(),
            source,
        })?;
        let (r, w) = tokio::io::split(stream);
        let reader = FramedRead::new(r, codec());
        let writer = FramedWrite::new(w, codec());

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let lost = CancellationToken::new();
        let (calls_tx, calls_rx) = mpsc::channel(32);

        tokio::spawn(write_loop(writer, calls_rx, pending.clone(), lost.clone()));
        tokio::spawn(read_loop(reader, pending, lost));

        Ok(Self { calls: calls_tx })
    }

    /// Issue one request and decode its reply. Fails with `Disconnected`
    /// (never blocks forever) if the connection is lost first.
    pub async fn call<R: DeserializeOwned>(&self, request: Request) -> Result<R, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.calls
            .send(Call {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        match reply_rx.await {
            Ok(Ok(value)) => serde_json::from_value(value).map_err(Error::Decode),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::Disconnected),
        }
    }
}

async fn write_loop(
    mut writer: FramedWrite<tokio::io::WriteHalf<TcpStream>, tokio_util::codec::LengthDelimitedCodec>,
    mut calls_rx: mpsc::Receiver<Call>,
    pending: Pending,
    lost: CancellationToken,
) {
    let mut next_id: u64 = 1;
    loop {
        let call = tokio::select! {
            _ = lost.cancelled() => break,
            call = calls_rx.recv() => match call {
                Some(call) => call,
                None => break, // Client dropped.
            },
        };

        let id = next_id;
        next_id += 1;
        let frame = RequestFrame {
            id,
            request: call.request,
        };
        let wire = match serde_json::to_vec(&frame) {
            Ok(wire) => wire,
            Err(error) => {
                let _ = call.reply.send(Err(Error::Encode(error)));
                continue;
            }
        };

        pending.lock().unwrap().insert(id, call.reply);
        if let Err(error) = writer.send(wire.into()).await {
            tracing::debug!(%error, "request write failed");
            break;
        }
    }
    lost.cancel();
    fail_pending(&pending);
}

async fn read_loop(
    mut reader: FramedRead<tokio::io::ReadHalf<TcpStream>, tokio_util::codec::LengthDelimitedCodec>,
    pending: Pending,
    lost: CancellationToken,
) {
    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                tracing::debug!(%error, "response read failed");
                break;
            }
        };
        let response: ResponseFrame = match serde_json::from_slice(&frame) {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed response frame");
                continue;
            }
        };
        let Some(reply) = pending.lock().unwrap().remove(&response.id) else {
            tracing::warn!(id = response.id, "response for unknown request id");
            continue;
        };
        let _ = reply.send(match response.outcome {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(message) => Err(Error::Remote(message)),
        });
    }
    // Stream ended or failed: every pending and future call must learn of
    // the disconnect rather than wait forever.
    lost.cancel();
    fail_pending(&pending);
}

fn fail_pending(pending: &Pending) {
    for (_, reply) in pending.lock().unwrap().drain() {
        let _ = reply.send(Err(Error::Disconnected));
    }
}
