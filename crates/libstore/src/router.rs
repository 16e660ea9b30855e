use crate::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use storage_proto::{Node, Ring};

// DialState is a node's client slot, which may be:
// - Ready (if Some)
// - Currently being dialed (if locked)
// - Neither (None and not locked).
// Ready clients also track their number of uses since the last sweep.
type DialState = Arc<tokio::sync::Mutex<Option<(rpc::Client, usize)>>>;

/// Routes each key to the storage node owning its namespace, holding one
/// lazily-dialed client per node which is reused across operations.
pub struct Router {
    ring: Ring,
    states: Mutex<HashMap<u32, DialState>>,
}

impl Router {
    pub fn new(servers: Vec<Node>) -> Self {
        Self {
            ring: Ring::new(servers),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// A ready client for the node owning `key`, dialing it first if
    /// needed.
    pub async fn client_for(&self, key: &str) -> Result<rpc::Client, Error> {
        let node = self.ring.route(key).ok_or(Error::EmptyRing)?.clone();
        let state = {
            // Non-async lock, never held across an await point.
            let mut states = self.states.lock().unwrap();
            states.entry(node.node_id).or_default().clone()
        };

        // Node-specific, async-aware lock.
        let mut state = state.lock().await;

        // Fast path: already dialed and ready.
        if let Some((ref client, uses)) = &mut *state {
            *uses += 1;
            return Ok(client.clone());
        }

        // Slow path: dial the node.
        let client = rpc::Client::dial(&node.host_port).await?;
        *state = Some((client.clone(), 1));
        Ok(client)
    }

    /// Drop clients not used since the preceding sweep. Call periodically;
    /// nodes whose keys the workload no longer touches should not pin
    /// connections forever.
    pub fn sweep(&self) {
        let mut states = self.states.lock().unwrap();
        states.retain(|node_id, state| {
            // Retain slots currently being dialed.
            let Ok(mut state) = state.try_lock() else {
                return true;
            };
            // Drop slots which never connected.
            let Some((_client, uses)) = &mut *state else {
                return false;
            };
            if *uses == 0 {
                tracing::debug!(node_id, "dropping idle storage connection");
                return false;
            }
            *uses = 0; // Mark for next sweep.
            true
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(id: u32) -> Node {
        Node {
            host_port: format!("127.0.0.1:{}", 40000 + id),
            node_id: id,
        }
    }

    #[test]
    fn routes_by_ring_position() {
        let hash = storage_proto::route_hash("user");
        let router = Router::new(vec![node(1), node(2)]);
        // Sanity: with tiny ids, every hash wraps to the lowest node.
        assert!(hash > 2);
        assert_eq!(router.ring().route("user:x").unwrap().node_id, 1);
    }

    #[tokio::test]
    async fn empty_ring_is_an_error() {
        let router = Router::new(Vec::new());
        let result = router.client_for("user:x").await;
        assert!(matches!(result, Err(Error::EmptyRing)));
    }
}
