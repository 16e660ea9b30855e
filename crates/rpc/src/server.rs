use crate::{codec, Handler, Error, Outcome, RequestFrame, ResponseFrame};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// A listening endpoint: accepts connections and serves each from its own
/// task, dispatching decoded requests to the handler concurrently.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept: Option<JoinHandle<()>>,
}

impl Server {
    pub async fn bind<H: Handler>(addr: SocketAddr, handler: Arc<H>) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;
        Self::from_listener(listener, handler)
    }

    /// Serve on an already-bound listener. Useful when the local address
    /// must be known (and advertised) before the handler exists.
    pub fn from_listener<H: Handler>(
        listener: TcpListener,
        handler: Arc<H>,
    ) -> Result<Self, Error> {
        let local_addr = listener.local_addr().map_err(Error::Bind)?;
        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(listener, handler, shutdown.clone()));
        tracing::info!(%local_addr, "rpc listening");
        Ok(Self {
            local_addr,
            shutdown,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down every connection task.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(accept) = self.accept.take() {
            let _ = accept.await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop<H: Handler>(
    listener: TcpListener,
    handler: Arc<H>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted rpc connection");
                tokio::spawn(connection(
                    stream,
                    peer,
                    handler.clone(),
                    shutdown.child_token(),
                ));
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
            }
        }
    }
}

async fn connection<H: Handler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    stop: CancellationToken,
) {
    let (r, w) = tokio::io::split(stream);
    let mut reader = FramedRead::new(r, codec());
    let mut writer = FramedWrite::new(w, codec());

    // Requests are handled by detached tasks; one writer serializes their
    // responses back onto the stream in completion order.
    let (respond_tx, mut respond_rx) = mpsc::channel::<Vec<u8>>(32);
    let write_task = tokio::spawn(async move {
        while let Some(wire) = respond_rx.recv().await {
            if writer.send(wire.into()).await.is_err() {
                return;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = reader.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                tracing::debug!(%peer, %error, "request read failed");
                break;
            }
            None => break,
        };
        let request: RequestFrame = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%peer, %error, "dropping malformed request frame");
                continue;
            }
        };

        let handler = handler.clone();
        let respond = respond_tx.clone();
        tokio::spawn(async move {
            let outcome = match handler.handle(request.request).await {
                Ok(value) => Outcome::Ok(value),
                Err(error) => Outcome::Err(format!("{error:#}")),
            };
            let response = ResponseFrame {
                id: request.id,
                outcome,
            };
            match serde_json::to_vec(&response) {
                Ok(wire) => {
                    let _ = respond.send(wire).await;
                }
                Err(error) => tracing::warn!(%error, "failed to encode response"),
            }
        });
    }

    drop(respond_tx);
    let _ = write_task.await;
    tracing::debug!(%peer, "rpc connection closed");
}
