//! Record types, status codes, and key-routing shared by storage nodes and
//! their caching clients.

use serde::{Deserialize, Serialize};

/// Sliding window over which a cache counts queries for one key.
pub const QUERY_CACHE_SECONDS: u64 = 10;
/// Queries within the window at which a cache starts requesting leases.
pub const QUERY_CACHE_THRESH: usize = 3;
/// Lifetime of a granted lease.
pub const LEASE_SECONDS: u64 = 10;
/// Extra slack a server allows past expiry, covering clock skew and
/// in-flight messages.
pub const LEASE_GUARD_SECONDS: u64 = 2;

/// Outcome of a storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    KeyNotFound,
    ItemNotFound,
    WrongServer,
    PutFailed,
    ItemExists,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::KeyNotFound => "EKEYNOTFOUND",
            Status::ItemNotFound => "EITEMNOTFOUND",
            Status::WrongServer => "EWRONGSERVER",
            Status::PutFailed => "EPUTFAILED",
            Status::ItemExists => "EITEMEXISTS",
        };
        f.write_str(name)
    }
}

/// A lease grant (or refusal) riding on a Get reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub granted: bool,
    pub valid_seconds: u64,
}

impl Lease {
    pub fn refused() -> Self {
        Self::default()
    }

    pub fn granted_for(valid_seconds: u64) -> Self {
        Self {
            granted: true,
            valid_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub want_lease: bool,
    /// Callback address of the cache requesting a lease.
    pub lease_client: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub status: Status,
    pub value: String,
    pub lease: Lease,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetListReply {
    pub status: Status,
    pub value: Vec<String>,
    pub lease: Lease,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReply {
    pub status: Status,
}

/// One storage node's position in the ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub host_port: String,
    pub node_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterArgs {
    pub server_info: Node,
}

/// Answers both Register and GetServers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub ready: bool,
    pub servers: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeLeaseArgs {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeLeaseReply {
    pub status: Status,
}

/// Every request a storage node or cache callback endpoint understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum Request {
    Get(GetArgs),
    GetList(GetArgs),
    Put(PutArgs),
    AppendToList(PutArgs),
    RemoveFromList(PutArgs),
    Register(RegisterArgs),
    GetServers,
    RevokeLease(RevokeLeaseArgs),
}

impl Request {
    /// The method name, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Get(_) => "get",
            Request::GetList(_) => "get_list",
            Request::Put(_) => "put",
            Request::AppendToList(_) => "append_to_list",
            Request::RemoveFromList(_) => "remove_from_list",
            Request::Register(_) => "register",
            Request::GetServers => "get_servers",
            Request::RevokeLease(_) => "revoke_lease",
        }
    }
}

/// 32-bit FNV-1 of the key's namespace prefix: the substring before the
/// first `':'`, or the whole key when it has none. This hash is normative —
/// every participant must route identically.
pub fn route_hash(key: &str) -> u32 {
    let prefix = key.split(':').next().unwrap_or(key);
    let mut hash: u32 = 2166136261;
    for byte in prefix.bytes() {
        hash = hash.wrapping_mul(16777619);
        hash ^= byte as u32;
    }
    hash
}

/// The serving topology: nodes sorted ascending by id. A key belongs to the
/// first node whose id is at least the key's routing hash, wrapping to the
/// lowest id when none qualifies.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    nodes: Vec<Node>,
}

impl Ring {
    pub fn new(mut nodes: Vec<Node>) -> Self {
        nodes.sort_by_key(|node| node.node_id);
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn route(&self, key: &str) -> Option<&Node> {
        let hash = route_hash(key);
        self.nodes
            .iter()
            .find(|node| node.node_id >= hash)
            .or_else(|| self.nodes.first())
    }

    /// Whether `node_id` owns `key` under this ring.
    pub fn owns(&self, node_id: u32, key: &str) -> bool {
        self.route(key).map(|node| node.node_id) == Some(node_id)
    }
}
