use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;
use storage_proto::{Node, RegisterArgs, RegisterReply, Request};

/// The master's view of cluster formation: a set of registered nodes that
/// becomes the ring once the expected count is reached. Registration is
/// idempotent per node.
pub struct Membership {
    expected: usize,
    nodes: Mutex<BTreeSet<Node>>,
}

impl Membership {
    /// A new membership seeded with the master itself.
    pub fn new(expected: usize, master: Node) -> Self {
        Self {
            expected,
            nodes: Mutex::new(BTreeSet::from([master])),
        }
    }

    pub fn register(&self, node: Node) -> RegisterReply {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.insert(node.clone()) {
            tracing::info!(host_port = %node.host_port, node_id = node.node_id, registered = nodes.len(), expected = self.expected, "node registered");
        }
        Self::reply(&nodes, self.expected)
    }

    pub fn servers(&self) -> RegisterReply {
        let nodes = self.nodes.lock().unwrap();
        Self::reply(&nodes, self.expected)
    }

    fn reply(nodes: &BTreeSet<Node>, expected: usize) -> RegisterReply {
        if nodes.len() >= expected {
            RegisterReply {
                ready: true,
                servers: nodes.iter().cloned().collect(),
            }
        } else {
            RegisterReply {
                ready: false,
                servers: Vec::new(),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("cluster did not become ready within {attempts} registration attempts")]
    NotReady { attempts: u32 },
}

/// Repeatedly register `node` with the master, once per second, until the
/// cluster reports ready and returns the complete ring.
pub async fn join(master: &str, node: Node, attempts: u32) -> Result<Vec<Node>, JoinError> {
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let client = match rpc::Client::dial(master).await {
            Ok(client) => client,
            Err(error) => {
                tracing::warn!(master, %error, "master not reachable yet");
                continue;
            }
        };
        let reply: RegisterReply = match client
            .call(Request::Register(RegisterArgs {
                server_info: node.clone(),
            }))
            .await
        {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(master, %error, "register call failed");
                continue;
            }
        };
        if reply.ready {
            tracing::info!(nodes = reply.servers.len(), "cluster ready");
            return Ok(reply.servers);
        }
    }
    Err(JoinError::NotReady { attempts })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(id: u32) -> Node {
        Node {
            host_port: format!("127.0.0.1:{id}"),
            node_id: id,
        }
    }

    #[test]
    fn becomes_ready_at_expected_count() {
        let membership = Membership::new(3, node(1));
        assert!(!membership.servers().ready);
        assert!(!membership.register(node(2)).ready);
        // Re-registration changes nothing.
        assert!(!membership.register(node(2)).ready);

        let reply = membership.register(node(3));
        assert!(reply.ready);
        assert_eq!(reply.servers.len(), 3);
        // Once ready, every later call returns the full ring.
        assert!(membership.register(node(2)).ready);
        assert_eq!(membership.servers().servers.len(), 3);
    }

    #[test]
    fn single_node_cluster_is_immediately_ready() {
        let membership = Membership::new(1, node(1));
        let reply = membership.servers();
        assert!(reply.ready);
        assert_eq!(reply.servers, vec![node(1)]);
    }
}
