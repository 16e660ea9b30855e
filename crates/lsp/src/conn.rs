use crate::message::Message;
use crate::socket::Socket;
use crate::{ConnId, Event, Params};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

// Per-source queue depths. Bounded, so a stalled consumer exerts
// backpressure instead of growing buffers without limit.
pub(crate) const DELIVER_DEPTH: usize = 64;
pub(crate) const ENQUEUE_DEPTH: usize = 64;
pub(crate) const READ_DEPTH: usize = 1024;

/// State observable outside the connection task: whether the connection
/// has begun closing (writes must be rejected).
pub(crate) struct Shared {
    pub closing: AtomicBool,
}

/// The handle through which an endpoint drives one connection. The
/// connection task itself holds only two outward capabilities — the network
/// socket and the application delivery queue — and no reference to its
/// parent multiplexer.
pub(crate) struct Handle {
    pub deliver: mpsc::Sender<Message>,
    pub enqueue: mpsc::Sender<Bytes>,
    pub close: CancellationToken,
    pub shared: Arc<Shared>,
}

pub(crate) struct Launched {
    pub handle: Handle,
    pub task: tokio::task::JoinHandle<()>,
}

/// An entry of the send buffer. The wire message is built at transmit time
/// so that payloads stamped before the CONNECT exchange completes still go
/// out under the server-assigned connection id.
enum Outbound {
    Connect,
    Data { seq: u8, payload: Bytes },
}

impl Outbound {
    fn seq(&self) -> u8 {
        match self {
            Outbound::Connect => 0,
            Outbound::Data { seq, .. } => *seq,
        }
    }
}

/// One connection's state machine, driven by a single owning task that
/// selects over its event sources: inbound messages, application payloads,
/// the epoch interval, and the close signal.
struct Conn {
    conn_id: ConnId,
    peer: SocketAddr,
    socket: Arc<Socket>,
    delivered: mpsc::Sender<Event>,
    params: Params,
    shared: Arc<Shared>,

    send_buf: VecDeque<Outbound>,
    next_send_seq: u8,
    next_recv_seq: u8,
    last_ack: Option<Message>,
    quiet_epochs: u32,
    closing: bool,
    established: Option<oneshot::Sender<ConnId>>,
}

/// Launch the server-side half of a connection whose CONNECT was just
/// accepted. It starts in Established state, with the CONNECT already
/// counted as received: `next_recv_seq` is 1 and the cached `Ack(id, 0)`
/// is transmitted as the task's first action.
pub(crate) fn spawn_server(
    conn_id: ConnId,
    peer: SocketAddr,
    socket: Arc<Socket>,
    delivered: mpsc::Sender<Event>,
    params: Params,
) -> Launched {
    spawn(Conn {
        conn_id,
        peer,
        socket,
        delivered,
        params,
        shared: Arc::new(Shared {
            closing: AtomicBool::new(false),
        }),
        send_buf: VecDeque::new(),
        next_send_seq: 1,
        next_recv_seq: 1,
        last_ack: Some(Message::ack(conn_id, 0)),
        quiet_epochs: 0,
        closing: false,
        established: None,
    })
}

/// Launch the client-side half: Establishing, with the CONNECT queued as
/// the head of the send buffer so the ordinary transmit/retransmit/ack
/// machinery carries the handshake. `established` resolves with the
/// server-assigned id once the CONNECT is acknowledged.
pub(crate) fn spawn_client(
    peer: SocketAddr,
    socket: Arc<Socket>,
    delivered: mpsc::Sender<Event>,
    params: Params,
    established: oneshot::Sender<ConnId>,
) -> Launched {
    spawn(Conn {
        conn_id: 0,
        peer,
        socket,
        delivered,
        params,
        shared: Arc::new(Shared {
            closing: AtomicBool::new(false),
        }),
        send_buf: VecDeque::from([Outbound::Connect]),
        next_send_seq: 1,
        next_recv_seq: 1,
        last_ack: None,
        quiet_epochs: 0,
        closing: false,
        established: Some(established),
    })
}

fn spawn(conn: Conn) -> Launched {
    let (deliver_tx, deliver_rx) = mpsc::channel(DELIVER_DEPTH);
    let (enqueue_tx, enqueue_rx) = mpsc::channel(ENQUEUE_DEPTH);
    let close = CancellationToken::new();
    let handle = Handle {
        deliver: deliver_tx,
        enqueue: enqueue_tx,
        close: close.clone(),
        shared: conn.shared.clone(),
    };
    let task = tokio::spawn(conn.run(deliver_rx, enqueue_rx, close));
    Launched { handle, task }
}

impl Conn {
    async fn run(
        mut self,
        mut deliver_rx: mpsc::Receiver<Message>,
        mut enqueue_rx: mpsc::Receiver<Bytes>,
        close: CancellationToken,
    ) {
        // First action on the wire: the server's ACK of the CONNECT, or the
        // client's CONNECT itself.
        if let Some(ack) = &self.last_ack {
            self.socket.send(ack, self.peer).await;
        }
        if let Some(head) = self.send_buf.front() {
            self.transmit(head).await;
        }

        let mut epochs = tokio::time::interval_at(
            tokio::time::Instant::now() + self.params.epoch,
            self.params.epoch,
        );
        epochs.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = deliver_rx.recv() => {
                    self.quiet_epochs = 0;
                    self.on_message(msg).await;
                }
                Some(payload) = enqueue_rx.recv(), if !self.closing => {
                    self.on_enqueue(payload).await;
                }
                _ = epochs.tick() => {
                    if self.on_epoch().await {
                        break;
                    }
                }
                _ = close.cancelled(), if !self.closing => {
                    tracing::debug!(conn_id = self.conn_id, "closing");
                    self.shared.closing.store(true, Ordering::SeqCst);
                    // Everything submitted before the close still goes out;
                    // only writes arriving after it are rejected.
                    while let Ok(payload) = enqueue_rx.try_recv() {
                        self.on_enqueue(payload).await;
                    }
                    self.closing = true;
                }
            }
            // A closing connection dies once its send buffer has drained.
            if self.closing && self.send_buf.is_empty() {
                break;
            }
        }

        self.shared.closing.store(true, Ordering::SeqCst);
        tracing::debug!(conn_id = self.conn_id, "connection dead");
        // Exactly one closed indication, ordered after every delivered
        // payload. The receiver may already be gone; that is fine.
        let _ = self.delivered.send(Event::Closed(self.conn_id)).await;
    }

    async fn on_message(&mut self, msg: Message) {
        match msg {
            Message::Data { seq, payload, .. } => {
                if seq == self.next_recv_seq {
                    self.next_recv_seq = self.next_recv_seq.wrapping_add(1);
                    let ack = Message::ack(self.conn_id, seq);
                    self.socket.send(&ack, self.peer).await;
                    self.last_ack = Some(ack);
                    let _ = self
                        .delivered
                        .send(Event::Data(self.conn_id, payload))
                        .await;
                } else {
                    // Duplicate or out of order. Re-ack the last in-order
                    // sequence so the sender can advance despite ACK loss.
                    tracing::debug!(
                        conn_id = self.conn_id,
                        seq,
                        expected = self.next_recv_seq,
                        "dropping out-of-order data"
                    );
                    if let Some(ack) = &self.last_ack {
                        self.socket.send(ack, self.peer).await;
                    }
                }
            }
            Message::Ack { conn_id, seq } => self.on_ack(conn_id, seq).await,
            Message::Connect { .. } => {
                // Duplicate CONNECT for an already-established connection.
                // No new state; the cached ACK goes out on the next tick.
                tracing::debug!(conn_id = self.conn_id, "duplicate connect");
            }
        }
    }

    async fn on_ack(&mut self, conn_id: u16, seq: u8) {
        let Some(head) = self.send_buf.front() else {
            // Nothing outstanding. Still counts as peer activity.
            return;
        };
        if head.seq() != seq {
            tracing::debug!(
                conn_id = self.conn_id,
                seq,
                expected = head.seq(),
                "ignoring stale ack"
            );
            return;
        }
        let was_connect = matches!(head, Outbound::Connect);
        self.send_buf.pop_front();

        if was_connect {
            // The ACK of our CONNECT carries the assigned connection id.
            self.conn_id = conn_id;
            // Cache a zero ACK so epoch ticks prove our liveness to the
            // server even before any data flows.
            self.last_ack = Some(Message::ack(conn_id, 0));
            if let Some(established) = self.established.take() {
                let _ = established.send(conn_id);
            }
            tracing::debug!(conn_id, "connection established");
        }

        // The window is one: acknowledging the head puts the next queued
        // message in flight immediately.
        if let Some(next) = self.send_buf.front() {
            self.transmit(next).await;
        }
    }

    async fn on_enqueue(&mut self, payload: Bytes) {
        let seq = self.next_send_seq;
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        self.send_buf.push_back(Outbound::Data { seq, payload });
        if self.send_buf.len() == 1 {
            if let Some(head) = self.send_buf.front() {
                self.transmit(head).await;
            }
        }
    }

    /// Returns true when the connection must die: the peer has been quiet
    /// for `epoch_limit` consecutive epochs.
    async fn on_epoch(&mut self) -> bool {
        self.quiet_epochs += 1;
        if self.quiet_epochs >= self.params.epoch_limit {
            tracing::debug!(
                conn_id = self.conn_id,
                quiet = self.quiet_epochs,
                "epoch limit reached, peer lost"
            );
            return true;
        }
        if let Some(head) = self.send_buf.front() {
            self.transmit(head).await;
        }
        if let Some(ack) = &self.last_ack {
            self.socket.send(ack, self.peer).await;
        }
        false
    }

    async fn transmit(&self, out: &Outbound) {
        let msg = match out {
            Outbound::Connect => Message::connect(),
            Outbound::Data { seq, payload } => {
                Message::data(self.conn_id, *seq, payload.clone())
            }
        };
        self.socket.send(&msg, self.peer).await;
    }
}
