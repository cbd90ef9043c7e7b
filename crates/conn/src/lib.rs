//! Sluice - Connections
//!
//! The outbound side of peer forwarding: a length-prefixed TCP connection
//! to another sluice server, a process-wide connection pool shared by every
//! network store, and the service-resolution seam for deployments that name
//! peers by service instead of host:port.
//!
//! # Sharing Model
//!
//! The pool is the only cross-worker shared object in the pipeline (besides
//! the clock). Stores hold an `Arc<ConnPool>` and never own pooled
//! connections; a pooled peer entry is reference-counted and closed when the
//! last store releases it.

mod peer;
mod pool;
mod resolver;

pub use peer::{ConnError, PeerConnection};
pub use pool::{ConnPool, PoolHandle};
pub use resolver::{NullResolver, ServiceResolver, StaticResolver};
