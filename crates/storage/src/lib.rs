//! A storage node: an in-memory key/value engine whose writes revoke
//! outstanding caching leases before they land, a per-key lease pool, and
//! the cluster-formation handshake that assembles the serving ring.

pub mod cluster;
pub mod leases;
pub mod service;
pub mod store;

pub use leases::LeaseTerms;
pub use service::{Role, StorageService};
