use rpc::{Client, Error, Handler, Server};
use std::sync::Arc;
use std::time::Duration;
use storage_proto::{GetArgs, GetReply, Lease, PutArgs, PutReply, Request, Status};

/// Answers Get with the key echoed into the value, Put with Ok after a
/// per-key artificial delay, and errors on everything else.
struct TestHandler;

#[async_trait::async_trait]
impl Handler for TestHandler {
    async fn handle(&self, req: Request) -> anyhow::Result<serde_json::Value> {
        match req {
            Request::Get(GetArgs { key, .. }) => {
                let reply = GetReply {
                    status: Status::Ok,
                    value: format!("value-of-{key}"),
                    lease: Lease::refused(),
                };
                Ok(serde_json::to_value(reply)?)
            }
            Request::Put(PutArgs { key, .. }) => {
                if key == "slow" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(serde_json::to_value(PutReply { status: Status::Ok })?)
            }
            other => anyhow::bail!("unsupported method {}", other.method()),
        }
    }
}

async fn start() -> (Server, Client) {
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(TestHandler))
        .await
        .expect("bind");
    let client = Client::dial(&server.local_addr().to_string())
        .await
        .expect("dial");
    (server, client)
}

fn get(key: &str) -> Request {
    Request::Get(GetArgs {
        key: key.to_string(),
        want_lease: false,
        lease_client: String::new(),
    })
}

#[tokio::test]
async fn round_trips_a_call() {
    let (_server, client) = start().await;
    let reply: GetReply = client.call(get("k")).await.unwrap();
    assert_eq!(reply.status, Status::Ok);
    assert_eq!(reply.value, "value-of-k");
}

#[tokio::test]
async fn slow_calls_do_not_block_concurrent_ones() {
    let (_server, client) = start().await;

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let _: PutReply = client
                .call(Request::Put(PutArgs {
                    key: "slow".into(),
                    value: "v".into(),
                }))
                .await
                .unwrap();
            started.elapsed()
        })
    };

    // A fast call on the same connection completes while the slow one is
    // still being handled.
    let started = tokio::time::Instant::now();
    let _: GetReply = client.call(get("fast")).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));
    assert!(slow.await.unwrap() >= Duration::from_millis(200));
}

#[tokio::test]
async fn handler_errors_arrive_as_remote_errors() {
    let (_server, client) = start().await;
    let result: Result<PutReply, _> = client.call(Request::GetServers).await;
    match result {
        Err(Error::Remote(message)) => assert!(message.contains("get_servers")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_fails_pending_and_future_calls() {
    let (server, client) = start().await;
    server.shutdown().await;

    // The connection is gone; calls must fail, not hang.
    let result: Result<GetReply, _> = client.call(get("k")).await;
    assert!(matches!(
        result,
        Err(Error::Disconnected) | Err(Error::Remote(_))
    ));
}

#[tokio::test]
async fn dialing_a_dead_address_fails() {
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap().to_string();
    drop(unused);
    assert!(matches!(
        Client::dial(&addr).await,
        Err(Error::Dial { .. })
    ));
}
