use crate::conn::{self, Handle, READ_DEPTH};
use crate::message::{Message, MAX_PAYLOAD};
use crate::socket::Socket;
use crate::{ConnId, Error, Event, Params};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The server multiplexer: owns the listening datagram socket, demultiplexes
/// inbound traffic to per-connection tasks by peer address, admits CONNECTs,
/// and funnels every connection's in-order deliveries into one read queue.
pub struct Server {
    local_addr: SocketAddr,
    events_rx: mpsc::Receiver<Event>,
    registry: Arc<Mutex<Registry>>,
    shutdown: CancellationToken,
    intake: Option<JoinHandle<()>>,
}

struct Registry {
    next_conn_id: ConnId,
    closing: bool,
    by_addr: HashMap<SocketAddr, ConnId>,
    conns: HashMap<ConnId, Entry>,
}

struct Entry {
    peer: SocketAddr,
    handle: Handle,
    task: Option<JoinHandle<()>>,
}

impl Registry {
    fn remove(&mut self, conn_id: ConnId) -> Option<Entry> {
        let entry = self.conns.remove(&conn_id)?;
        self.by_addr.remove(&entry.peer);
        Some(entry)
    }
}

impl Server {
    /// Bind the listening socket and start accepting connections.
    pub async fn bind(addr: SocketAddr, params: Params) -> Result<Self, Error> {
        let socket = Arc::new(Socket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let registry = Arc::new(Mutex::new(Registry {
            next_conn_id: 1,
            closing: false,
            by_addr: HashMap::new(),
            conns: HashMap::new(),
        }));
        let (events_tx, events_rx) = mpsc::channel(READ_DEPTH);
        let shutdown = CancellationToken::new();

        let intake = tokio::spawn(intake(
            socket.clone(),
            registry.clone(),
            events_tx,
            params,
            shutdown.clone(),
        ));
        tracing::info!(%local_addr, "listening");

        Ok(Self {
            local_addr,
            events_rx,
            registry,
            shutdown,
            intake: Some(intake),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The next in-order payload from any connection, or the one-time closed
    /// indication for a connection that died. Connections share a single
    /// FIFO queue, so none can starve the others. Returns `None` only after
    /// `close_all`, once every buffered event has been read.
    pub async fn read(&mut self) -> Option<Event> {
        let event = self.events_rx.recv().await?;
        if let Event::Closed(conn_id) = event {
            let _ = self.registry.lock().unwrap().remove(conn_id);
        }
        Some(event)
    }

    /// Queue a payload for ordered, reliable delivery on one connection.
    pub async fn write(&self, conn_id: ConnId, payload: Bytes) -> Result<(), Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        let enqueue = {
            let registry = self.registry.lock().unwrap();
            let entry = registry.conns.get(&conn_id).ok_or(Error::UnknownConn(conn_id))?;
            if entry.handle.shared.closing.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            entry.handle.enqueue.clone()
        };
        enqueue
            .send(payload)
            .await
            .map_err(|_| Error::UnknownConn(conn_id))
    }

    /// Begin a graceful close: the connection drains its send buffer, then
    /// dies and surfaces `Event::Closed` through `read`. Idempotent.
    pub fn close(&self, conn_id: ConnId) -> Result<(), Error> {
        let registry = self.registry.lock().unwrap();
        let entry = registry.conns.get(&conn_id).ok_or(Error::UnknownConn(conn_id))?;
        // Gate writes immediately; the task observes the token and drains.
        entry.handle.shared.closing.store(true, Ordering::SeqCst);
        entry.handle.close.cancel();
        Ok(())
    }

    /// Gracefully close every connection, resolving only when each one has
    /// drained its send buffer or died trying. Intake keeps running until
    /// the drain completes so that final ACKs still arrive.
    pub async fn close_all(&mut self) {
        // Entries stay registered while draining: inbound ACKs must keep
        // routing to their connections or the drain could never finish.
        let tasks: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock().unwrap();
            registry.closing = true;
            registry
                .conns
                .values_mut()
                .filter_map(|entry| {
                    entry.handle.shared.closing.store(true, Ordering::SeqCst);
                    entry.handle.close.cancel();
                    entry.task.take()
                })
                .collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.shutdown.cancel();
        if let Some(intake) = self.intake.take() {
            let _ = intake.await;
        }
        let mut registry = self.registry.lock().unwrap();
        registry.by_addr.clear();
        registry.conns.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let registry = self.registry.lock().unwrap();
        for entry in registry.conns.values() {
            entry.handle.close.cancel();
        }
    }
}

enum Route {
    Deliver(ConnId, mpsc::Sender<Message>),
    None,
}

async fn intake(
    socket: Arc<Socket>,
    registry: Arc<Mutex<Registry>>,
    events_tx: mpsc::Sender<Event>,
    params: Params,
    shutdown: CancellationToken,
) {
    loop {
        let (msg, from) = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = socket.recv() => match received {
                Some(received) => received,
                None => return,
            },
        };

        // Route under the registry lock, deliver outside it.
        let route = {
            let mut reg = registry.lock().unwrap();
            match reg.by_addr.get(&from) {
                Some(&conn_id) => match reg.conns.get(&conn_id) {
                    Some(entry) => Route::Deliver(conn_id, entry.handle.deliver.clone()),
                    None => Route::None,
                },
                None => {
                    if matches!(msg, Message::Connect { .. }) && !reg.closing {
                        admit(&mut reg, from, &socket, &events_tx, params);
                    } else {
                        tracing::debug!(peer = %from, "dropping datagram for unknown connection");
                    }
                    Route::None
                }
            }
        };

        if let Route::Deliver(conn_id, deliver) = route {
            if deliver.send(msg).await.is_err() {
                // The connection task has exited; reap its registry entry.
                let _ = registry.lock().unwrap().remove(conn_id);
            }
        }
    }
}

/// Admit a CONNECT from a previously unknown peer: allocate the next id and
/// launch the connection task, which immediately transmits `Ack(id, 0)`.
fn admit(
    reg: &mut Registry,
    from: SocketAddr,
    socket: &Arc<Socket>,
    events_tx: &mpsc::Sender<Event>,
    params: Params,
) {
    let Some(next) = reg.next_conn_id.checked_add(1) else {
        tracing::warn!(peer = %from, "connection ids exhausted, rejecting connect");
        return;
    };
    let conn_id = reg.next_conn_id;
    reg.next_conn_id = next;

    let launched = conn::spawn_server(conn_id, from, socket.clone(), events_tx.clone(), params);
    tracing::info!(conn_id, peer = %from, "accepted connection");
    reg.by_addr.insert(from, conn_id);
    reg.conns.insert(
        conn_id,
        Entry {
            peer: from,
            handle: launched.handle,
            task: Some(launched.task),
        },
    );
}
