//! Injection point for the partition rebalancing algorithm. The algorithm
//! itself lives outside this crate; the coordinator only invokes it under the
//! subscription lock and writes the changeset back.

use crate::model::{Partition, Session};

/// Computes a changeset of partition records from the current sessions and
/// assignment. An empty changeset means nothing to write. Pure; called only
/// while the subscription lock is held.
pub trait Rebalancer: Send + Sync {
    fn rebalance(&self, sessions: &[Session], partitions: &[Partition]) -> Vec<Partition>;
}

/// Rebalancer that never moves anything. Useful when assignment is managed
/// externally, and as the builder default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRebalancer;

impl Rebalancer for NoopRebalancer {
    fn rebalance(&self, _sessions: &[Session], _partitions: &[Partition]) -> Vec<Partition> {
        Vec::new()
    }
}
