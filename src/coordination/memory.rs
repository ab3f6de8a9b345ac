//! In-memory implementation of the coordination-store traits.
//!
//! Keeps the session registry, topology node and offset nodes in process
//! memory and reproduces the store's watch contract: watches are one-shot and
//! re-armed by `get_data`/`refresh`. Handlers fire synchronously on the
//! thread performing the mutation, which is fine because handlers only
//! enqueue tasks.
//!
//! `update_partitions_configuration` and `transfer` refuse to run unless the
//! subscription lock is held, so a call site that skips the lock surfaces as
//! a coordination error instead of a silent lost update.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::coordination::{
    CoordinationClient, DataWatch, LockGuard, OffsetWatch, Watch, WatchHandler,
};
use crate::cursor::BEGIN_OFFSET;
use crate::error::{Error, Result};
use crate::model::{EventTypePartition, Partition, Session, Topology};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

struct WatchEntry {
    id: u64,
    armed: bool,
    handler: WatchHandler,
}

#[derive(Default)]
struct StoreInner {
    sessions: BTreeMap<String, Session>,
    topology: Topology,
    offsets: HashMap<EventTypePartition, String>,
    next_watch_id: u64,
    topology_watches: Vec<WatchEntry>,
    session_watches: Vec<WatchEntry>,
    offset_watches: HashMap<EventTypePartition, Vec<WatchEntry>>,
}

impl StoreInner {
    fn new_watch(&mut self, handler: WatchHandler) -> WatchEntry {
        self.next_watch_id += 1;
        WatchEntry {
            id: self.next_watch_id,
            armed: true,
            handler,
        }
    }
}

/// Takes the handlers of all armed entries and disarms them; the caller
/// invokes the handlers after releasing the store mutex.
fn collect_armed(entries: &mut [WatchEntry]) -> Vec<WatchHandler> {
    entries
        .iter_mut()
        .filter(|e| e.armed)
        .map(|e| {
            e.armed = false;
            Arc::clone(&e.handler)
        })
        .collect()
}

fn fire(handlers: Vec<WatchHandler>) {
    for handler in handlers {
        handler();
    }
}

/// In-memory coordination store for one subscription.
#[derive(Clone)]
pub struct InMemoryCoordination {
    inner: Arc<Mutex<StoreInner>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    lock_held: Arc<AtomicBool>,
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        InMemoryCoordination {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            lock: Arc::new(tokio::sync::Mutex::new(())),
            lock_held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Writes a partition's committed offset node and fires its watches.
    /// This is the entry point used by the commit path (and by tests).
    pub fn put_offset(&self, key: &EventTypePartition, raw: impl Into<String>) {
        let handlers = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            inner.offsets.insert(key.clone(), raw.into());
            inner
                .offset_watches
                .get_mut(key)
                .map(|entries| collect_armed(entries))
                .unwrap_or_default()
        };
        fire(handlers);
    }

    /// Number of live watches across all nodes. Diagnostics only.
    pub fn watch_count(&self) -> usize {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.topology_watches.len()
            + inner.session_watches.len()
            + inner.offset_watches.values().map(Vec::len).sum::<usize>()
    }

    fn require_lock(&self, operation: &str) -> Result<()> {
        if !self.lock_held.load(Ordering::SeqCst) {
            return Err(Error::Coordination(format!(
                "{operation} requires the subscription lock"
            )));
        }
        Ok(())
    }
}

struct MemoryLockGuard {
    _guard: OwnedMutexGuard<()>,
    held: Arc<AtomicBool>,
}

impl LockGuard for MemoryLockGuard {}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

struct TopologyWatchHandle {
    store: Arc<Mutex<StoreInner>>,
    id: u64,
    closed: bool,
}

impl Watch for TopologyWatchHandle {
    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let mut inner = self.store.lock().expect("store mutex poisoned");
            inner.topology_watches.retain(|e| e.id != self.id);
            self.closed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl DataWatch<Topology> for TopologyWatchHandle {
    async fn get_data(&mut self) -> Result<Topology> {
        let mut inner = self.store.lock().expect("store mutex poisoned");
        let entry = inner
            .topology_watches
            .iter_mut()
            .find(|e| e.id == self.id)
            .ok_or_else(|| Error::Coordination("topology watch is closed".into()))?;
        entry.armed = true;
        Ok(inner.topology.clone())
    }
}

struct SessionListWatchHandle {
    store: Arc<Mutex<StoreInner>>,
    id: u64,
    closed: bool,
}

impl Watch for SessionListWatchHandle {
    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let mut inner = self.store.lock().expect("store mutex poisoned");
            inner.session_watches.retain(|e| e.id != self.id);
            self.closed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl DataWatch<Vec<String>> for SessionListWatchHandle {
    async fn get_data(&mut self) -> Result<Vec<String>> {
        let mut inner = self.store.lock().expect("store mutex poisoned");
        let entry = inner
            .session_watches
            .iter_mut()
            .find(|e| e.id == self.id)
            .ok_or_else(|| Error::Coordination("session list watch is closed".into()))?;
        entry.armed = true;
        Ok(inner.sessions.keys().cloned().collect())
    }
}

struct OffsetWatchHandle {
    store: Arc<Mutex<StoreInner>>,
    key: EventTypePartition,
    id: u64,
    closed: bool,
}

impl Watch for OffsetWatchHandle {
    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let mut inner = self.store.lock().expect("store mutex poisoned");
            if let Some(entries) = inner.offset_watches.get_mut(&self.key) {
                entries.retain(|e| e.id != self.id);
                if entries.is_empty() {
                    inner.offset_watches.remove(&self.key);
                }
            }
            self.closed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl OffsetWatch for OffsetWatchHandle {
    async fn refresh(&mut self) -> Result<()> {
        let mut inner = self.store.lock().expect("store mutex poisoned");
        let entry = inner
            .offset_watches
            .get_mut(&self.key)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == self.id))
            .ok_or_else(|| {
                Error::Coordination(format!("offset watch for {} is closed", self.key))
            })?;
        entry.armed = true;
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordination {
    async fn subscribe_for_topology_changes(
        &self,
        handler: WatchHandler,
    ) -> Result<Box<dyn DataWatch<Topology>>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let entry = inner.new_watch(handler);
        let id = entry.id;
        inner.topology_watches.push(entry);
        Ok(Box::new(TopologyWatchHandle {
            store: Arc::clone(&self.inner),
            id,
            closed: false,
        }))
    }

    async fn subscribe_for_offset_changes(
        &self,
        key: &EventTypePartition,
        handler: WatchHandler,
    ) -> Result<Box<dyn OffsetWatch>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let entry = inner.new_watch(handler);
        let id = entry.id;
        inner
            .offset_watches
            .entry(key.clone())
            .or_default()
            .push(entry);
        Ok(Box::new(OffsetWatchHandle {
            store: Arc::clone(&self.inner),
            key: key.clone(),
            id,
            closed: false,
        }))
    }

    async fn subscribe_for_session_list_changes(
        &self,
        handler: WatchHandler,
    ) -> Result<Box<dyn DataWatch<Vec<String>>>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let entry = inner.new_watch(handler);
        let id = entry.id;
        inner.session_watches.push(entry);
        Ok(Box::new(SessionListWatchHandle {
            store: Arc::clone(&self.inner),
            id,
            closed: false,
        }))
    }

    async fn get_offset(&self, key: &EventTypePartition) -> Result<String> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .offsets
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Coordination(format!("no offset node for partition {key}")))
    }

    async fn register_session(&self, session: &Session) -> Result<()> {
        let handlers = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            inner.sessions.insert(session.id.clone(), session.clone());
            collect_armed(&mut inner.session_watches)
        };
        fire(handlers);
        Ok(())
    }

    async fn unregister_session(&self, session: &Session) -> Result<()> {
        let handlers = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            if inner.sessions.remove(&session.id).is_none() {
                Vec::new()
            } else {
                collect_armed(&mut inner.session_watches)
            }
        };
        fire(handlers);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.sessions.values().cloned().collect())
    }

    async fn list_partitions(&self) -> Result<Vec<Partition>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.topology.partitions.clone())
    }

    async fn update_partitions_configuration(&self, changes: &[Partition]) -> Result<()> {
        self.require_lock("update_partitions_configuration")?;
        if changes.is_empty() {
            return Ok(());
        }
        let handlers = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            for change in changes {
                let key = change.key();
                match inner.topology.partitions.iter().position(|p| p.key() == key) {
                    Some(index) => inner.topology.partitions[index] = change.clone(),
                    None => inner.topology.partitions.push(change.clone()),
                }
                // A partition entering the topology gets an offset node so
                // commit watchers always have something to read.
                inner.offsets.entry(key).or_insert_with(|| BEGIN_OFFSET.into());
            }
            inner.topology.version += 1;
            collect_armed(&mut inner.topology_watches)
        };
        fire(handlers);
        Ok(())
    }

    async fn transfer(&self, from_session: &str, keys: &[EventTypePartition]) -> Result<()> {
        self.require_lock("transfer")?;
        if keys.is_empty() {
            return Ok(());
        }
        let handlers = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            let target = inner
                .sessions
                .keys()
                .find(|id| id.as_str() != from_session)
                .cloned();
            let mut changed = false;
            for record in inner.topology.partitions.iter_mut() {
                if !keys.contains(&record.key()) || !record.owned_by(from_session) {
                    continue;
                }
                match &target {
                    Some(id) => {
                        record.session = Some(id.clone());
                        record.state = crate::model::PartitionState::Assigned;
                    }
                    None => {
                        record.session = None;
                        record.state = crate::model::PartitionState::Unassigned;
                    }
                }
                changed = true;
            }
            if changed {
                inner.topology.version += 1;
                collect_armed(&mut inner.topology_watches)
            } else {
                Vec::new()
            }
        };
        fire(handlers);
        Ok(())
    }

    async fn lock(&self) -> Result<Box<dyn LockGuard>> {
        let guard = tokio::time::timeout(LOCK_TIMEOUT, Arc::clone(&self.lock).lock_owned())
            .await
            .map_err(|_| Error::Coordination("subscription lock acquisition timed out".into()))?;
        self.lock_held.store(true, Ordering::SeqCst);
        Ok(Box::new(MemoryLockGuard {
            _guard: guard,
            held: Arc::clone(&self.lock_held),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartitionState;
    use std::sync::atomic::AtomicUsize;

    fn assigned(event_type: &str, partition: &str, session: &str) -> Partition {
        Partition {
            event_type: event_type.into(),
            partition: partition.into(),
            session: Some(session.into()),
            state: PartitionState::Assigned,
        }
    }

    fn counting_handler() -> (WatchHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::clone(&count);
        let handler: WatchHandler = Arc::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[tokio::test]
    async fn test_topology_watch_is_one_shot_until_rearmed() {
        let store = InMemoryCoordination::new();
        let (handler, count) = counting_handler();
        let mut watch = store.subscribe_for_topology_changes(handler).await.unwrap();

        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[assigned("orders", "0", "s1")])
            .await
            .unwrap();
        store
            .update_partitions_configuration(&[assigned("orders", "1", "s1")])
            .await
            .unwrap();
        drop(guard);

        // Second change happened while disarmed.
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // get_data re-arms and returns the latest snapshot.
        let topology = watch.get_data().await.unwrap();
        assert_eq!(topology.version, 2);
        assert_eq!(topology.partitions.len(), 2);

        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[assigned("orders", "2", "s1")])
            .await
            .unwrap();
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offset_watch_fires_and_rearms() {
        let store = InMemoryCoordination::new();
        let key = EventTypePartition::new("orders", "0");
        let (handler, count) = counting_handler();
        let mut watch = store
            .subscribe_for_offset_changes(&key, handler)
            .await
            .unwrap();

        store.put_offset(&key, "5");
        store.put_offset(&key, "6");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_offset(&key).await.unwrap(), "6");

        watch.refresh().await.unwrap();
        store.put_offset(&key, "7");
        assert_eq!(count.load(Ordering::SeqCst), 2);

        watch.close().unwrap();
        watch.close().unwrap();
        assert_eq!(store.watch_count(), 0);
        store.put_offset(&key, "8");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_configuration_writes_require_lock() {
        let store = InMemoryCoordination::new();
        let err = store
            .update_partitions_configuration(&[assigned("orders", "0", "s1")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Coordination(_)));

        let err = store
            .transfer("s1", &[EventTypePartition::new("orders", "0")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Coordination(_)));
    }

    #[tokio::test]
    async fn test_transfer_moves_partition_to_other_session() {
        let store = InMemoryCoordination::new();
        store
            .register_session(&Session::new("s1", 1))
            .await
            .unwrap();
        store
            .register_session(&Session::new("s2", 1))
            .await
            .unwrap();

        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[assigned("orders", "0", "s1")])
            .await
            .unwrap();
        store
            .transfer("s1", &[EventTypePartition::new("orders", "0")])
            .await
            .unwrap();
        drop(guard);

        let partitions = store.list_partitions().await.unwrap();
        assert_eq!(partitions[0].session.as_deref(), Some("s2"));
        assert_eq!(partitions[0].state, PartitionState::Assigned);
    }

    #[tokio::test]
    async fn test_transfer_with_no_other_session_unassigns() {
        let store = InMemoryCoordination::new();
        store
            .register_session(&Session::new("s1", 1))
            .await
            .unwrap();

        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[assigned("orders", "0", "s1")])
            .await
            .unwrap();
        store
            .transfer("s1", &[EventTypePartition::new("orders", "0")])
            .await
            .unwrap();
        drop(guard);

        let partitions = store.list_partitions().await.unwrap();
        assert_eq!(partitions[0].session, None);
        assert_eq!(partitions[0].state, PartitionState::Unassigned);
    }

    #[tokio::test]
    async fn test_session_registration_is_idempotent_and_watched() {
        let store = InMemoryCoordination::new();
        let (handler, count) = counting_handler();
        let mut watch = store
            .subscribe_for_session_list_changes(handler)
            .await
            .unwrap();

        let session = Session::new("s1", 1);
        store.register_session(&session).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(watch.get_data().await.unwrap(), vec!["s1".to_string()]);

        store.register_session(&session).await.unwrap();
        store.unregister_session(&session).await.unwrap();
        assert_eq!(store.list_sessions().await.unwrap(), vec![]);
        // Unregistering an absent session fires nothing.
        let before = count.load(Ordering::SeqCst);
        store.unregister_session(&session).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_new_partition_gets_begin_offset_node() {
        let store = InMemoryCoordination::new();
        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[assigned("orders", "0", "s1")])
            .await
            .unwrap();
        drop(guard);
        let key = EventTypePartition::new("orders", "0");
        assert_eq!(store.get_offset(&key).await.unwrap(), BEGIN_OFFSET);
    }
}
