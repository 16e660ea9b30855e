use bytes::Bytes;

/// Largest application payload accepted by `write`. Sized so that the
/// base64-encoded JSON envelope stays within a single conservative datagram.
pub const MAX_PAYLOAD: usize = 1400;

/// Receive buffer size for a single datagram.
pub(crate) const MAX_DATAGRAM: usize = 2048;

/// A wire message. Each datagram carries exactly one, encoded as canonical
/// JSON with the payload as base64.
///
/// CONNECT always travels with `conn_id = 0` and `seq = 0`; the ACK that
/// answers it carries `seq = 0` and the server-assigned connection id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Connect {
        conn_id: u16,
        seq: u8,
    },
    Data {
        conn_id: u16,
        seq: u8,
        #[serde(with = "b64")]
        payload: Bytes,
    },
    Ack {
        conn_id: u16,
        seq: u8,
    },
}

impl Message {
    pub fn connect() -> Self {
        Self::Connect { conn_id: 0, seq: 0 }
    }

    pub fn ack(conn_id: u16, seq: u8) -> Self {
        Self::Ack { conn_id, seq }
    }

    pub fn data(conn_id: u16, seq: u8, payload: Bytes) -> Self {
        Self::Data {
            conn_id,
            seq,
            payload,
        }
    }

    pub fn conn_id(&self) -> u16 {
        match *self {
            Self::Connect { conn_id, .. }
            | Self::Data { conn_id, .. }
            | Self::Ack { conn_id, .. } => conn_id,
        }
    }

    pub fn seq(&self) -> u8 {
        match *self {
            Self::Connect { seq, .. } | Self::Data { seq, .. } | Self::Ack { seq, .. } => seq,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a received datagram. Callers must pass exactly the bytes
    /// received, never the full receive buffer.
    pub fn decode(datagram: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(datagram)
    }
}

mod b64 {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
