//! Abstract interface over the hierarchical watched coordination store.
//!
//! The store keeps, per subscription: the session registry, the partition
//! topology, per-partition committed offsets and a subscription-global lock.
//! Watches are one-shot: after a change fires the handler, the watch stays
//! disarmed until `get_data`/`refresh` re-arms it, which also returns the
//! latest snapshot. Handlers run on an unspecified thread and must do nothing
//! but enqueue a task.
//!
//! The traits use `async_trait` to enable object safety, so the client can be
//! shared as `Arc<dyn CoordinationClient>`.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{EventTypePartition, Partition, Session, Topology};

pub mod memory;

/// Callback installed on a watched node. Captures at most a task-queue handle
/// and a partition key; the real work happens in the enqueued task.
pub type WatchHandler = std::sync::Arc<dyn Fn() + Send + Sync>;

/// Handle to a watch installed on a coordination-store node.
pub trait Watch: Send {
    /// Releases the watch. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Watch over a node carrying data: `get_data` re-arms the watch and returns
/// the latest snapshot atomically.
#[async_trait]
pub trait DataWatch<T>: Watch {
    async fn get_data(&mut self) -> Result<T>;
}

/// Watch over a per-partition offset node. The offset value itself is read
/// one-shot via [`CoordinationClient::get_offset`]; `refresh` only re-arms.
#[async_trait]
pub trait OffsetWatch: Watch {
    async fn refresh(&mut self) -> Result<()>;
}

/// Held for the duration of a read-compute-write sequence touching the
/// session-to-partition mapping. Dropping the guard releases the lock.
pub trait LockGuard: Send {}

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Installs a one-shot-rearming watch on the topology node. The handler
    /// is invoked once per version seen until re-armed.
    async fn subscribe_for_topology_changes(
        &self,
        handler: WatchHandler,
    ) -> Result<Box<dyn DataWatch<Topology>>>;

    /// Installs a one-shot-rearming watch on one partition's offset node.
    async fn subscribe_for_offset_changes(
        &self,
        key: &EventTypePartition,
        handler: WatchHandler,
    ) -> Result<Box<dyn OffsetWatch>>;

    /// Installs a one-shot-rearming watch on the session registry.
    async fn subscribe_for_session_list_changes(
        &self,
        handler: WatchHandler,
    ) -> Result<Box<dyn DataWatch<Vec<String>>>>;

    /// One-shot read of a partition's committed offset.
    async fn get_offset(&self, key: &EventTypePartition) -> Result<String>;

    /// Registers the session in the registry. Idempotent by session id.
    async fn register_session(&self, session: &Session) -> Result<()>;

    /// Removes the session from the registry. Idempotent.
    async fn unregister_session(&self, session: &Session) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<Session>>;

    async fn list_partitions(&self) -> Result<Vec<Partition>>;

    /// Writes a batch of new partition assignments. Must be called while
    /// holding the guard returned by [`CoordinationClient::lock`].
    async fn update_partitions_configuration(&self, changes: &[Partition]) -> Result<()>;

    /// Atomically moves the listed partitions out of `from_session`, marking
    /// them for reassignment to any eligible session. Must be called while
    /// holding the guard returned by [`CoordinationClient::lock`].
    async fn transfer(&self, from_session: &str, keys: &[EventTypePartition]) -> Result<()>;

    /// Acquires the subscription-global lock with a bounded wait. Fails with
    /// a coordination error if the lock cannot be acquired in time.
    async fn lock(&self) -> Result<Box<dyn LockGuard>>;
}
