use crate::cluster::Membership;
use crate::leases::{LeasePool, LeaseTerms};
use crate::store::KvStore;
use std::sync::{Arc, RwLock};
use storage_proto::{
    GetArgs, GetListReply, GetReply, Lease, Node, PutArgs, PutReply, RegisterArgs, RegisterReply,
    Request, Ring, Status,
};

pub enum Role {
    /// Accumulates registrations and announces the ring.
    Master(Membership),
    /// Learns the ring by registering with the master.
    Replica,
}

/// One storage node's RPC surface. Every key operation first checks ring
/// ownership; writes run through the lease pool's revocation protocol
/// before touching the engine.
pub struct StorageService {
    node_id: u32,
    role: Role,
    store: KvStore,
    leases: LeasePool,
    ring: RwLock<Option<Ring>>,
}

impl StorageService {
    pub fn master(
        node_id: u32,
        expected: usize,
        self_node: Node,
        terms: LeaseTerms,
    ) -> Arc<Self> {
        let membership = Membership::new(expected, self_node);
        let service = Arc::new(Self {
            node_id,
            role: Role::Master(membership),
            store: KvStore::new(),
            leases: LeasePool::new(terms),
            ring: RwLock::new(None),
        });
        // A cluster of one is ready the moment the master boots.
        if let Role::Master(membership) = &service.role {
            let reply = membership.servers();
            if reply.ready {
                service.install_ring(reply.servers);
            }
        }
        service
    }

    pub fn replica(node_id: u32, terms: LeaseTerms) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            role: Role::Replica,
            store: KvStore::new(),
            leases: LeasePool::new(terms),
            ring: RwLock::new(None),
        })
    }

    /// Install the completed ring. Idempotent; later calls keep the first.
    pub fn install_ring(&self, servers: Vec<Node>) {
        let mut ring = self.ring.write().unwrap();
        if ring.is_none() {
            tracing::info!(nodes = servers.len(), "serving ring installed");
            *ring = Some(Ring::new(servers));
        }
    }

    pub fn ready(&self) -> bool {
        self.ring.read().unwrap().is_some()
    }

    /// A node serves only keys the ring routes to it; everything else —
    /// including any key before the ring is known — is a foreign key.
    fn owns(&self, key: &str) -> bool {
        self.ring
            .read()
            .unwrap()
            .as_ref()
            .map(|ring| ring.owns(self.node_id, key))
            .unwrap_or(false)
    }

    fn get(&self, args: GetArgs) -> GetReply {
        if !self.owns(&args.key) {
            return GetReply {
                status: Status::WrongServer,
                value: String::new(),
                lease: Lease::refused(),
            };
        }
        match self.store.get(&args.key) {
            Some(value) => GetReply {
                status: Status::Ok,
                value,
                lease: self.maybe_grant(&args),
            },
            None => GetReply {
                status: Status::KeyNotFound,
                value: String::new(),
                lease: Lease::refused(),
            },
        }
    }

    fn get_list(&self, args: GetArgs) -> GetListReply {
        if !self.owns(&args.key) {
            return GetListReply {
                status: Status::WrongServer,
                value: Vec::new(),
                lease: Lease::refused(),
            };
        }
        match self.store.get_list(&args.key) {
            Some(value) => GetListReply {
                status: Status::Ok,
                value,
                lease: self.maybe_grant(&args),
            },
            None => GetListReply {
                status: Status::KeyNotFound,
                value: Vec::new(),
                lease: Lease::refused(),
            },
        }
    }

    fn maybe_grant(&self, args: &GetArgs) -> Lease {
        if args.want_lease && !args.lease_client.is_empty() {
            self.leases.try_grant(&args.key, &args.lease_client)
        } else {
            Lease::refused()
        }
    }

    async fn put(&self, args: PutArgs) -> PutReply {
        if !self.owns(&args.key) {
            return PutReply {
                status: Status::WrongServer,
            };
        }
        let status = self
            .leases
            .write_through(&args.key, || self.store.put(&args.key, &args.value))
            .await;
        PutReply { status }
    }

    async fn append(&self, args: PutArgs) -> PutReply {
        if !self.owns(&args.key) {
            return PutReply {
                status: Status::WrongServer,
            };
        }
        let status = self
            .leases
            .write_through(&args.key, || self.store.append(&args.key, &args.value))
            .await;
        PutReply { status }
    }

    async fn remove(&self, args: PutArgs) -> PutReply {
        if !self.owns(&args.key) {
            return PutReply {
                status: Status::WrongServer,
            };
        }
        // An absent key answers immediately; only real mutations revoke.
        if !self.store.contains(&args.key) {
            return PutReply {
                status: Status::KeyNotFound,
            };
        }
        let status = self
            .leases
            .write_through(&args.key, || self.store.remove(&args.key, &args.value))
            .await;
        PutReply { status }
    }

    fn register(&self, args: RegisterArgs) -> anyhow::Result<RegisterReply> {
        let Role::Master(membership) = &self.role else {
            anyhow::bail!("register called on a non-master node");
        };
        let reply = membership.register(args.server_info);
        if reply.ready {
            self.install_ring(reply.servers.clone());
        }
        Ok(reply)
    }

    fn get_servers(&self) -> anyhow::Result<RegisterReply> {
        let Role::Master(membership) = &self.role else {
            anyhow::bail!("get_servers called on a non-master node");
        };
        Ok(membership.servers())
    }
}

#[async_trait::async_trait]
impl rpc::Handler for StorageService {
    async fn handle(&self, req: Request) -> anyhow::Result<serde_json::Value> {
        let method = req.method();
        tracing::debug!(method, "handling");
        let value = match req {
            Request::Get(args) => serde_json::to_value(self.get(args))?,
            Request::GetList(args) => serde_json::to_value(self.get_list(args))?,
            Request::Put(args) => serde_json::to_value(self.put(args).await)?,
            Request::AppendToList(args) => serde_json::to_value(self.append(args).await)?,
            Request::RemoveFromList(args) => serde_json::to_value(self.remove(args).await)?,
            Request::Register(args) => serde_json::to_value(self.register(args)?)?,
            Request::GetServers => serde_json::to_value(self.get_servers()?)?,
            Request::RevokeLease(_) => {
                anyhow::bail!("revoke_lease is served by caches, not storage nodes")
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn two_node_service() -> (Arc<StorageService>, u32, u32) {
        let hash = storage_proto::route_hash("user");
        let mine = hash; // first id at or above the hash
        let other = hash.wrapping_sub(1000);
        let service = StorageService::replica(mine, LeaseTerms::default());
        service.install_ring(vec![
            Node {
                host_port: "here:1".into(),
                node_id: mine,
            },
            Node {
                host_port: "there:1".into(),
                node_id: other,
            },
        ]);
        (service, mine, other)
    }

    #[tokio::test]
    async fn foreign_keys_are_refused_without_side_effects() {
        let (service, mine, _) = two_node_service();
        // Find a prefix the ring routes to the other node.
        let foreign = (0..1000)
            .map(|i| format!("p{i}:x"))
            .find(|key| {
                !service
                    .ring
                    .read()
                    .unwrap()
                    .as_ref()
                    .unwrap()
                    .owns(mine, key)
            })
            .expect("some prefix routes to the other node");

        let reply = service
            .put(PutArgs {
                key: foreign.clone(),
                value: "v".into(),
            })
            .await;
        assert_eq!(reply.status, Status::WrongServer);
        assert!(!service.store.contains(&foreign));

        let owned = service
            .put(PutArgs {
                key: "user:1".into(),
                value: "v".into(),
            })
            .await;
        assert_eq!(owned.status, Status::Ok);
    }

    #[tokio::test]
    async fn not_ready_node_owns_nothing() {
        let service = StorageService::replica(1, LeaseTerms::default());
        let reply = service.get(GetArgs {
            key: "user:1".into(),
            want_lease: false,
            lease_client: String::new(),
        });
        assert_eq!(reply.status, Status::WrongServer);
    }
}
