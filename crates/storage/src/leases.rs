use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage_proto::{
    Lease, Request, RevokeLeaseArgs, RevokeLeaseReply, LEASE_GUARD_SECONDS, LEASE_SECONDS,
};
use tokio::time::Instant;

/// Lease lifetime and the slack allowed past it before the server stops
/// waiting on a holder. Defaults are the protocol constants; tests inject
/// shorter terms to exercise the expiry race quickly.
#[derive(Debug, Clone, Copy)]
pub struct LeaseTerms {
    pub valid: Duration,
    pub guard: Duration,
}

impl Default for LeaseTerms {
    fn default() -> Self {
        Self {
            valid: Duration::from_secs(LEASE_SECONDS),
            guard: Duration::from_secs(LEASE_GUARD_SECONDS),
        }
    }
}

impl LeaseTerms {
    /// The instant past which a lease issued at `issued_at` no longer
    /// obligates the server to wait for its holder.
    fn expiry(&self, issued_at: Instant) -> Instant {
        issued_at + self.valid + self.guard
    }
}

/// Outstanding leases, per key. The map lock covers only membership;
/// each key's state has its own locks so revocation of one key never
/// delays operations on another.
pub struct LeasePool {
    terms: LeaseTerms,
    keys: Mutex<HashMap<String, Arc<KeyState>>>,
}

struct KeyState {
    /// Serializes writers of this key across the whole
    /// revoke-then-mutate sequence.
    write_mu: tokio::sync::Mutex<()>,
    lease: Mutex<LeaseState>,
}

#[derive(Default)]
struct LeaseState {
    /// True while a write is revoking: no new leases, and the entry must
    /// survive (not be deleted) so later grant attempts observe it.
    pending: bool,
    holders: Vec<Holder>,
}

#[derive(Debug, Clone)]
struct Holder {
    callback: String,
    issued_at: Instant,
}

impl LeasePool {
    pub fn new(terms: LeaseTerms) -> Self {
        Self {
            terms,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn terms(&self) -> LeaseTerms {
        self.terms
    }

    fn key_state(&self, key: &str) -> Arc<KeyState> {
        let mut keys = self.keys.lock().unwrap();
        keys.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeyState {
                    write_mu: tokio::sync::Mutex::new(()),
                    lease: Mutex::new(LeaseState::default()),
                })
            })
            .clone()
    }

    /// Grant (or refresh) a lease for `client`, unless a write is pending
    /// on the key — in which case the request is refused and the caller
    /// simply gets no caching rights this time.
    pub fn try_grant(&self, key: &str, client: &str) -> Lease {
        let state = self.key_state(key);
        let mut lease = state.lease.lock().unwrap();
        if lease.pending {
            return Lease::refused();
        }
        let now = Instant::now();
        // Expired holders are dead weight; drop them while we are here.
        let terms = self.terms;
        lease.holders.retain(|holder| now < terms.expiry(holder.issued_at));
        match lease
            .holders
            .iter_mut()
            .find(|holder| holder.callback == client)
        {
            Some(holder) => holder.issued_at = now,
            None => lease.holders.push(Holder {
                callback: client.to_string(),
                issued_at: now,
            }),
        }
        Lease::granted_for(self.terms.valid.as_secs())
    }

    /// Run one write to `key`: serialize against other writers of the same
    /// key, revoke every live lease (bounded by each holder's absolute
    /// expiry), apply `mutate`, then reopen the key for leasing.
    ///
    /// Writes to other keys proceed in parallel throughout; only this key's
    /// state is held.
    pub async fn write_through<T>(&self, key: &str, mutate: impl FnOnce() -> T) -> T {
        let state = self.key_state(key);
        let _write = state.write_mu.lock().await;

        let holders = {
            let mut lease = state.lease.lock().unwrap();
            lease.pending = true;
            std::mem::take(&mut lease.holders)
        };
        self.revoke_all(key, holders).await;

        let result = mutate();

        // Reopened only once the mutation is visible, so a lease granted
        // from here on can only ever cache the new value.
        state.lease.lock().unwrap().pending = false;
        result
    }

    async fn revoke_all(&self, key: &str, holders: Vec<Holder>) {
        let now = Instant::now();
        let live: Vec<Holder> = holders
            .into_iter()
            .filter(|holder| now < self.terms.expiry(holder.issued_at))
            .collect();
        if live.is_empty() {
            return;
        }
        tracing::debug!(key, holders = live.len(), "revoking leases");
        futures::future::join_all(
            live.into_iter()
                .map(|holder| self.revoke_one(key, holder)),
        )
        .await;
    }

    /// One holder's revocation: completed by an acknowledged RPC, or by the
    /// holder's lease passing its absolute expiry — whichever comes first.
    /// An unreachable holder is waited out, never trusted.
    async fn revoke_one(&self, key: &str, holder: Holder) {
        let deadline = self.terms.expiry(holder.issued_at);
        let attempt = async {
            let client = rpc::Client::dial(&holder.callback).await?;
            let reply: RevokeLeaseReply = client
                .call(Request::RevokeLease(RevokeLeaseArgs {
                    key: key.to_string(),
                }))
                .await?;
            anyhow::Ok(reply)
        };
        match tokio::time::timeout_at(deadline, attempt).await {
            Ok(Ok(_reply)) => {
                tracing::debug!(key, callback = %holder.callback, "lease revoked");
            }
            Ok(Err(error)) => {
                tracing::debug!(
                    key,
                    callback = %holder.callback,
                    %error,
                    "revoke failed, waiting out lease expiry"
                );
                tokio::time::sleep_until(deadline).await;
            }
            Err(_elapsed) => {
                tracing::debug!(key, callback = %holder.callback, "lease expired unacknowledged");
            }
        }
    }
}
