use libstore::{Error, LeaseMode, Libstore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{cluster, LeaseTerms, StorageService};
use storage_proto::{GetArgs, GetReply, Node, Request, Ring, Status};

/// Boot a single-node cluster whose advertised address is its real
/// listener address.
async fn boot_storage(terms: LeaseTerms) -> (rpc::Server, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let service = StorageService::master(
        1,
        1,
        Node {
            host_port: addr.clone(),
            node_id: 1,
        },
        terms,
    );
    let server = rpc::Server::from_listener(listener, service).unwrap();
    (server, addr)
}

#[tokio::test]
async fn reads_and_writes_through_the_cluster() {
    let (_server, master) = boot_storage(LeaseTerms::default()).await;
    let store = Libstore::new(&master, None, LeaseMode::Normal).await.unwrap();

    assert!(matches!(
        store.get("user:missing").await,
        Err(Error::Status(Status::KeyNotFound))
    ));

    store.put("user:k", "v").await.unwrap();
    assert_eq!(store.get("user:k").await.unwrap(), "v");

    store.append_to_list("user:l", "a").await.unwrap();
    store.append_to_list("user:l", "b").await.unwrap();
    assert!(matches!(
        store.append_to_list("user:l", "a").await,
        Err(Error::Status(Status::ItemExists))
    ));
    assert_eq!(
        store.get_list("user:l").await.unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );

    store.remove_from_list("user:l", "a").await.unwrap();
    assert!(matches!(
        store.remove_from_list("user:l", "a").await,
        Err(Error::Status(Status::ItemNotFound))
    ));
    assert_eq!(store.get_list("user:l").await.unwrap(), vec!["b".to_string()]);
}

#[tokio::test]
async fn two_queries_do_not_acquire_a_lease() {
    let (server, master) = boot_storage(LeaseTerms::default()).await;
    let store = Libstore::new(&master, Some("127.0.0.1:0"), LeaseMode::Normal)
        .await
        .unwrap();
    store.put("user:k", "v").await.unwrap();

    assert_eq!(store.get("user:k").await.unwrap(), "v");
    assert_eq!(store.get("user:k").await.unwrap(), "v");

    // Nothing was cached, so with storage gone the next read must fail.
    server.shutdown().await;
    assert!(store.get("user:k").await.is_err());
}

#[tokio::test]
async fn third_query_acquires_a_lease() {
    let (server, master) = boot_storage(LeaseTerms::default()).await;
    let store = Libstore::new(&master, Some("127.0.0.1:0"), LeaseMode::Normal)
        .await
        .unwrap();
    store.put("user:k", "v").await.unwrap();

    for _ in 0..3 {
        assert_eq!(store.get("user:k").await.unwrap(), "v");
    }

    // The third query crossed the admission threshold and installed a
    // lease; the cache now serves reads with storage gone entirely.
    server.shutdown().await;
    assert_eq!(store.get("user:k").await.unwrap(), "v");
}

#[tokio::test]
async fn always_lease_mode_caches_the_first_read() {
    let (server, master) = boot_storage(LeaseTerms::default()).await;
    let store = Libstore::new(&master, Some("127.0.0.1:0"), LeaseMode::Always)
        .await
        .unwrap();
    store.put("user:l", "x").await.unwrap();
    store.append_to_list("user:list", "x").await.unwrap();

    assert_eq!(store.get("user:l").await.unwrap(), "x");
    assert_eq!(
        store.get_list("user:list").await.unwrap(),
        vec!["x".to_string()]
    );

    server.shutdown().await;
    assert_eq!(store.get("user:l").await.unwrap(), "x");
    assert_eq!(
        store.get_list("user:list").await.unwrap(),
        vec!["x".to_string()]
    );
}

#[tokio::test]
async fn no_callback_address_never_requests_leases() {
    let (server, master) = boot_storage(LeaseTerms::default()).await;
    // Even Always is overridden when there is nowhere to deliver revokes.
    let store = Libstore::new(&master, None, LeaseMode::Always).await.unwrap();
    store.put("user:k", "v").await.unwrap();

    for _ in 0..5 {
        assert_eq!(store.get("user:k").await.unwrap(), "v");
    }
    server.shutdown().await;
    assert!(store.get("user:k").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_revoke_remote_caches() {
    let (_server, master) = boot_storage(LeaseTerms::default()).await;
    let reader = Libstore::new(&master, Some("127.0.0.1:0"), LeaseMode::Always)
        .await
        .unwrap();
    let writer = Libstore::new(&master, None, LeaseMode::Normal).await.unwrap();

    writer.put("user:k", "old").await.unwrap();
    assert_eq!(reader.get("user:k").await.unwrap(), "old");

    // The put must revoke the reader's lease and return promptly (the
    // reader acknowledges; nothing waits out an expiry).
    let started = tokio::time::Instant::now();
    writer.put("user:k", "new").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    // A lease-covered read would have served "old"; the revocation forces
    // the reader back to storage.
    assert_eq!(reader.get("user:k").await.unwrap(), "new");
}

/// A pass-through proxy that counts requests by method before forwarding,
/// so tests can assert which reads were answered from the cache without
/// touching the wire.
struct CountingProxy {
    upstream: rpc::Client,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl CountingProxy {
    fn count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl rpc::Handler for CountingProxy {
    async fn handle(&self, req: Request) -> anyhow::Result<serde_json::Value> {
        *self.calls.lock().unwrap().entry(req.method()).or_default() += 1;
        let value: serde_json::Value = self.upstream.call(req).await?;
        Ok(value)
    }
}

/// Boot a single-node cluster whose only advertised address is a counting
/// proxy in front of the real node.
async fn boot_proxied() -> (rpc::Server, rpc::Server, Arc<CountingProxy>, String) {
    let proxy_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap().to_string();

    let service = StorageService::master(
        1,
        1,
        Node {
            host_port: proxy_addr.clone(),
            node_id: 1,
        },
        LeaseTerms::default(),
    );
    let storage_server = rpc::Server::bind("127.0.0.1:0".parse().unwrap(), service)
        .await
        .unwrap();

    let proxy = Arc::new(CountingProxy {
        upstream: rpc::Client::dial(&storage_server.local_addr().to_string())
            .await
            .unwrap(),
        calls: Mutex::new(HashMap::new()),
    });
    let proxy_server = rpc::Server::from_listener(proxy_listener, proxy.clone()).unwrap();
    (storage_server, proxy_server, proxy, proxy_addr)
}

#[tokio::test]
async fn leased_reads_skip_the_wire() {
    let (_storage, _proxy_server, proxy, master) = boot_proxied().await;
    let store = Libstore::new(&master, Some("127.0.0.1:0"), LeaseMode::Always)
        .await
        .unwrap();

    store.put("user:k", "v").await.unwrap();
    for _ in 0..5 {
        assert_eq!(store.get("user:k").await.unwrap(), "v");
    }

    // One miss fetched and leased the value; the other four reads never
    // reached the node.
    assert_eq!(proxy.count("get"), 1);
    assert_eq!(proxy.count("put"), 1);
}

#[tokio::test]
async fn admission_threshold_bounds_rpc_traffic() {
    let (_storage, _proxy_server, proxy, master) = boot_proxied().await;
    let store = Libstore::new(&master, Some("127.0.0.1:0"), LeaseMode::Normal)
        .await
        .unwrap();

    store.put("user:k", "v").await.unwrap();
    for _ in 0..5 {
        assert_eq!(store.get("user:k").await.unwrap(), "v");
    }

    // The first two reads miss without a lease, the third earns one, and
    // the remaining two are cache hits.
    assert_eq!(proxy.count("get"), 3);
}

#[tokio::test]
async fn startup_fails_when_cluster_never_becomes_ready() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    // Expects two nodes; the second never arrives.
    let service = StorageService::master(
        1,
        2,
        Node {
            host_port: addr.clone(),
            node_id: 1,
        },
        LeaseTerms::default(),
    );
    let _server = rpc::Server::from_listener(listener, service).unwrap();

    let result = Libstore::new(&addr, None, LeaseMode::Normal).await;
    assert!(matches!(result, Err(Error::NotReady { .. })));
}

#[tokio::test]
async fn routes_around_the_ring() {
    // Master and replica, with disjoint key ownership.
    let master_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master_addr = master_listener.local_addr().unwrap().to_string();
    let master_node = Node {
        host_port: master_addr.clone(),
        node_id: 0x4000_0000,
    };
    let master_service =
        StorageService::master(0x4000_0000, 2, master_node, LeaseTerms::default());
    let _master_server =
        rpc::Server::from_listener(master_listener, master_service.clone()).unwrap();

    let replica_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let replica_addr = replica_listener.local_addr().unwrap().to_string();
    let replica_node = Node {
        host_port: replica_addr.clone(),
        node_id: 0xc000_0000,
    };
    let replica_service = StorageService::replica(0xc000_0000, LeaseTerms::default());
    let _replica_server =
        rpc::Server::from_listener(replica_listener, replica_service.clone()).unwrap();

    let servers = cluster::join(&master_addr, replica_node, 5).await.unwrap();
    replica_service.install_ring(servers.clone());

    // Find keys owned by each node.
    let ring = Ring::new(servers);
    let owned_by = |id: u32| {
        (0..10_000)
            .map(|i| format!("p{i}:x"))
            .find(|key| ring.owns(id, key))
            .expect("some prefix routes to the node")
    };
    let master_key = owned_by(0x4000_0000);
    let replica_key = owned_by(0xc000_0000);

    // Asking the wrong node directly is refused...
    let direct = rpc::Client::dial(&master_addr).await.unwrap();
    let reply: GetReply = direct
        .call(Request::Get(GetArgs {
            key: replica_key.clone(),
            want_lease: false,
            lease_client: String::new(),
        }))
        .await
        .unwrap();
    assert_eq!(reply.status, Status::WrongServer);

    // ...while the router sends each key to its owner.
    let store = Libstore::new(&master_addr, None, LeaseMode::Normal)
        .await
        .unwrap();
    store.put(&master_key, "m").await.unwrap();
    store.put(&replica_key, "r").await.unwrap();
    assert_eq!(store.get(&master_key).await.unwrap(), "m");
    assert_eq!(store.get(&replica_key).await.unwrap(), "r");
}
