//! Consistent-hash ring and keyed object pool primitives.
//!
//! These two pieces are deliberately decoupled from memcached's wire format:
//! `ring` maps an opaque byte key to a member of type `S`, and `pool` pools
//! any `Poolable` resource behind a `ResourceFactory`. The `cachemux` crate
//! wires them together around a `Server` key and a `Connection` resource.

pub mod pool;
pub mod ring;

pub use pool::{Pool, PoolConfig, PoolError, PoolStats, Pooled, Poolable, ResourceFactory};
pub use ring::{HashAlgorithm, HashRing};
