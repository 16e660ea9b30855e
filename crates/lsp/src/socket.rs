use crate::message::{Message, MAX_DATAGRAM};
use crate::Error;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// The datagram endpoint: one UDP socket shared by every connection of an
/// endpoint. Transmission is fire-and-forget; the substrate may lose or
/// reorder datagrams, and reliability lives entirely in the connection
/// state machines above.
pub(crate) struct Socket {
    udp: UdpSocket,
}

impl Socket {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let udp = UdpSocket::bind(addr).await.map_err(Error::Bind)?;
        Ok(Self { udp })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.udp.local_addr().map_err(Error::Bind)
    }

    /// Serialize and transmit one message. Failures are logged and dropped:
    /// a lost transmit is indistinguishable from a lost datagram, and the
    /// epoch machinery already covers both.
    pub async fn send(&self, msg: &Message, to: SocketAddr) {
        let wire = match msg.encode() {
            Ok(wire) => wire,
            Err(error) => {
                tracing::warn!(%error, "failed to encode outbound message");
                return;
            }
        };
        if let Err(error) = self.udp.send_to(&wire, to).await {
            tracing::debug!(%error, peer = %to, "datagram send failed");
        }
    }

    /// Receive the next parseable message. Malformed datagrams are logged
    /// and skipped; only the `n` bytes actually received are ever parsed.
    /// Returns `None` if the socket itself fails fatally.
    pub async fn recv(&self) -> Option<(Message, SocketAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = match self.udp.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(error) => {
                    tracing::warn!(%error, "datagram receive failed");
                    return None;
                }
            };
            match Message::decode(&buf[..n]) {
                Ok(msg) => return Some((msg, from)),
                Err(error) => {
                    tracing::warn!(%error, peer = %from, len = n, "dropping malformed datagram")
                }
            }
        }
    }
}
