//! The storage client: routes each operation to the node owning the key,
//! caches values under time-bounded leases, and serves the revocation
//! callback through which storage nodes reclaim those leases before
//! conflicting writes proceed.

mod cache;
mod router;

use cache::{Cache, Cached, Lookup};
use router::Router;
use std::sync::Arc;
use std::time::Duration;
use storage_proto::{
    GetArgs, GetListReply, GetReply, PutArgs, PutReply, RegisterReply, Request, RevokeLeaseArgs,
    RevokeLeaseReply, Status,
};

const GET_SERVERS_ATTEMPTS: u32 = 5;
const GET_SERVERS_DELAY: Duration = Duration::from_millis(500);

/// When to ask storage for a lease alongside a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Ask once the key's query frequency crosses the admission threshold.
    Normal,
    /// Ask on every miss.
    Always,
    /// Never ask. Forced when no callback address is configured, since a
    /// lease the server cannot revoke must never be issued.
    Never,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage cluster not ready after {attempts} attempts")]
    NotReady { attempts: u32 },
    #[error("no storage nodes in the ring")]
    EmptyRing,
    #[error("invalid callback address")]
    InvalidCallback(#[source] std::net::AddrParseError),
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    #[error("storage returned {0}")]
    Status(Status),
}

/// One application's handle on the storage cluster.
pub struct Libstore {
    mode: LeaseMode,
    callback_addr: Option<String>,
    cache: Arc<Cache>,
    router: Router,
    // Held for its lifetime: dropping it stops serving revocations.
    _callback: Option<rpc::Server>,
}

impl Libstore {
    /// Fetch the ring from the master (a bounded number of attempts) and,
    /// when `my_hostport` is given, start serving the revoke callback
    /// there. Pass a port of 0 to let the kernel choose; the advertised
    /// callback address always reflects the bound port.
    pub async fn new(
        master: &str,
        my_hostport: Option<&str>,
        mode: LeaseMode,
    ) -> Result<Self, Error> {
        let servers = fetch_ring(master).await?;
        let cache = Arc::new(Cache::new());

        let (callback, callback_addr, mode) = match my_hostport {
            Some(hostport) => {
                let addr: std::net::SocketAddr =
                    hostport.parse().map_err(Error::InvalidCallback)?;
                let server = rpc::Server::bind(
                    addr,
                    Arc::new(CallbackService {
                        cache: cache.clone(),
                    }),
                )
                .await?;
                let advertised = server.local_addr().to_string();
                tracing::debug!(callback = %advertised, "serving revoke callback");
                (Some(server), Some(advertised), mode)
            }
            None => (None, None, LeaseMode::Never),
        };

        Ok(Self {
            mode,
            callback_addr,
            cache,
            router: Router::new(servers),
            _callback: callback,
        })
    }

    /// The address storage nodes call back to revoke this cache's leases.
    pub fn callback_addr(&self) -> Option<&str> {
        self.callback_addr.as_deref()
    }

    pub async fn get(&self, key: &str) -> Result<String, Error> {
        let lookup = self.cache.lookup(key);
        if let Lookup::Hit(Cached::Value(value)) = &lookup {
            return Ok(value.clone());
        }
        let want_lease = self.want_lease(&lookup);
        let client = self.router.client_for(key).await?;
        let reply: GetReply = client
            .call(Request::Get(GetArgs {
                key: key.to_string(),
                want_lease,
                lease_client: self.lease_client(),
            }))
            .await?;
        if reply.status != Status::Ok {
            return Err(Error::Status(reply.status));
        }
        if reply.lease.granted {
            self.cache.grant(
                key,
                Cached::Value(reply.value.clone()),
                Duration::from_secs(reply.lease.valid_seconds),
            );
        }
        Ok(reply.value)
    }

    pub async fn get_list(&self, key: &str) -> Result<Vec<String>, Error> {
        let lookup = self.cache.lookup(key);
        if let Lookup::Hit(Cached::List(items)) = &lookup {
            return Ok(items.clone());
        }
        let want_lease = self.want_lease(&lookup);
        let client = self.router.client_for(key).await?;
        let reply: GetListReply = client
            .call(Request::GetList(GetArgs {
                key: key.to_string(),
                want_lease,
                lease_client: self.lease_client(),
            }))
            .await?;
        if reply.status != Status::Ok {
            return Err(Error::Status(reply.status));
        }
        if reply.lease.granted {
            self.cache.grant(
                key,
                Cached::List(reply.value.clone()),
                Duration::from_secs(reply.lease.valid_seconds),
            );
        }
        Ok(reply.value)
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        self.write(Request::Put(PutArgs {
            key: key.to_string(),
            value: value.to_string(),
        }))
        .await
    }

    pub async fn append_to_list(&self, key: &str, item: &str) -> Result<(), Error> {
        self.write(Request::AppendToList(PutArgs {
            key: key.to_string(),
            value: item.to_string(),
        }))
        .await
    }

    pub async fn remove_from_list(&self, key: &str, item: &str) -> Result<(), Error> {
        self.write(Request::RemoveFromList(PutArgs {
            key: key.to_string(),
            value: item.to_string(),
        }))
        .await
    }

    /// Drop idle per-node connections; see [`Router::sweep`].
    pub fn sweep_connections(&self) {
        self.router.sweep();
    }

    async fn write(&self, request: Request) -> Result<(), Error> {
        let key = match &request {
            Request::Put(args) | Request::AppendToList(args) | Request::RemoveFromList(args) => {
                args.key.clone()
            }
            _ => String::new(),
        };
        let client = self.router.client_for(&key).await?;
        let reply: PutReply = client.call(request).await?;
        match reply.status {
            Status::Ok => Ok(()),
            status => Err(Error::Status(status)),
        }
    }

    fn want_lease(&self, lookup: &Lookup) -> bool {
        match self.mode {
            LeaseMode::Never => false,
            LeaseMode::Always => true,
            LeaseMode::Normal => matches!(lookup, Lookup::MissWantLease),
        }
    }

    fn lease_client(&self) -> String {
        self.callback_addr.clone().unwrap_or_default()
    }
}

async fn fetch_ring(master: &str) -> Result<Vec<storage_proto::Node>, Error> {
    for attempt in 0..GET_SERVERS_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(GET_SERVERS_DELAY).await;
        }
        let client = match rpc::Client::dial(master).await {
            Ok(client) => client,
            Err(error) => {
                tracing::warn!(master, %error, "master not reachable");
                continue;
            }
        };
        match client.call::<RegisterReply>(Request::GetServers).await {
            Ok(reply) if reply.ready => return Ok(reply.servers),
            Ok(_) => tracing::debug!(master, "cluster not ready yet"),
            Err(error) => tracing::warn!(master, %error, "get_servers failed"),
        }
    }
    Err(Error::NotReady {
        attempts: GET_SERVERS_ATTEMPTS,
    })
}

/// The inbound surface storage nodes use to reclaim leases.
struct CallbackService {
    cache: Arc<Cache>,
}

#[async_trait::async_trait]
impl rpc::Handler for CallbackService {
    async fn handle(&self, req: Request) -> anyhow::Result<serde_json::Value> {
        match req {
            Request::RevokeLease(RevokeLeaseArgs { key }) => {
                tracing::debug!(key, "lease revoked");
                self.cache.revoke(&key);
                // Revoking a key that was never cached is fine: the entry
                // may have expired or been swept already.
                Ok(serde_json::to_value(RevokeLeaseReply {
                    status: Status::Ok,
                })?)
            }
            other => anyhow::bail!("unexpected method {}", other.method()),
        }
    }
}
