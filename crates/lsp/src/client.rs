use crate::conn::{self, Handle, READ_DEPTH};
use crate::message::MAX_PAYLOAD;
use crate::socket::Socket;
use crate::{ConnId, Error, Event, Params};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// The single-connection variant of the multiplexer: one dialed connection,
/// established before the constructor returns.
pub struct Client {
    conn_id: ConnId,
    events_rx: mpsc::Receiver<Event>,
    handle: Handle,
    task: Option<JoinHandle<()>>,
    intake: JoinHandle<()>,
}

impl Client {
    /// Dial `server`, send CONNECT, and resolve once the server's ACK
    /// assigns a connection id — or fail after the epoch limit passes with
    /// no acknowledgement.
    pub async fn connect(server: SocketAddr, params: Params) -> Result<Self, Error> {
        let bind = if server.is_ipv4() {
            SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0)
        };
        let socket = Arc::new(Socket::bind(bind).await?);

        let (events_tx, events_rx) = mpsc::channel(READ_DEPTH);
        let (established_tx, established_rx) = oneshot::channel();
        let launched = conn::spawn_client(server, socket.clone(), events_tx, params, established_tx);

        // Intake: route datagrams from the server to the connection task.
        let deliver = launched.handle.deliver.clone();
        let intake_socket = socket.clone();
        let intake = tokio::spawn(async move {
            loop {
                let Some((msg, from)) = intake_socket.recv().await else {
                    return;
                };
                if from != server {
                    tracing::debug!(peer = %from, "dropping datagram from unexpected peer");
                    continue;
                }
                if deliver.send(msg).await.is_err() {
                    return;
                }
            }
        });

        match established_rx.await {
            Ok(conn_id) => {
                tracing::debug!(conn_id, %server, "connected");
                Ok(Self {
                    conn_id,
                    events_rx,
                    handle: launched.handle,
                    task: Some(launched.task),
                    intake,
                })
            }
            Err(_) => {
                // The connection task died without establishing.
                intake.abort();
                Err(Error::ConnectTimeout)
            }
        }
    }

    /// The server-assigned connection id.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// The next in-order payload, or `None` once the connection is closed
    /// or the peer is lost. After the first `None`, every subsequent call
    /// also returns `None`.
    pub async fn read(&mut self) -> Option<Bytes> {
        match self.events_rx.recv().await? {
            Event::Data(_, payload) => Some(payload),
            Event::Closed(_) => None,
        }
    }

    /// Queue a payload for ordered, reliable delivery.
    pub async fn write(&self, payload: Bytes) -> Result<(), Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        if self.handle.shared.closing.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.handle.enqueue.send(payload).await.map_err(|_| Error::Closed)
    }

    /// Gracefully close: drain the send buffer, then tear down. Idempotent.
    pub async fn close(&mut self) {
        self.handle.shared.closing.store(true, Ordering::SeqCst);
        self.handle.close.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.intake.abort();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.close.cancel();
        self.intake.abort();
    }
}
