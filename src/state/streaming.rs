//! Normal serving state. Tracks, per owned partition, the highest position
//! streamed to the client without an observed commit, and watches the offset
//! nodes so commits clear those entries. On a close trigger it hands the
//! remaining uncommitted offsets over to the closing protocol.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::{ClosingHandoff, SessionTask, StreamingContext};
use crate::coordination::{DataWatch, OffsetWatch};
use crate::error::{Error, Result};
use crate::model::{Cursor, EventTypePartition, Topology};
use crate::state::{ClosingState, State};

pub(crate) struct StreamingState {
    uncommitted_offsets: HashMap<EventTypePartition, Cursor>,
    last_commit_at: Instant,
    assigned: BTreeSet<EventTypePartition>,
    topology_listener: Option<Box<dyn DataWatch<Topology>>>,
    offset_listeners: HashMap<EventTypePartition, Box<dyn OffsetWatch>>,
    closing_requested: bool,
}

impl StreamingState {
    pub(crate) fn new() -> Self {
        StreamingState {
            uncommitted_offsets: HashMap::new(),
            last_commit_at: Instant::now(),
            assigned: BTreeSet::new(),
            topology_listener: None,
            offset_listeners: HashMap::new(),
            closing_requested: false,
        }
    }

    pub(crate) async fn on_enter(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        self.last_commit_at = Instant::now();

        let handle = ctx.handle().clone();
        self.topology_listener = Some(
            ctx.client()
                .subscribe_for_topology_changes(Arc::new(move || {
                    handle.add_task(SessionTask::TopologyChanged)
                }))
                .await?,
        );
        self.react_on_topology(ctx).await?;

        if let Some(stream_timeout) = ctx.parameters().stream_timeout {
            ctx.handle()
                .schedule_task(SessionTask::CloseRequested, stream_timeout);
        }
        Ok(())
    }

    pub(crate) async fn on_topology_changed(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        if self.topology_listener.is_none() {
            return Err(Error::Internal(
                "topology watch must be installed when a topology change is delivered".into(),
            ));
        }
        self.react_on_topology(ctx).await
    }

    /// Aligns the local view with the store: watch the offset node of every
    /// owned partition, drop local tracking of partitions that moved away.
    async fn react_on_topology(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        let topology = match self.topology_listener.as_mut() {
            Some(listener) => listener.get_data().await?,
            None => {
                return Err(Error::Internal(
                    "topology watch must be installed while streaming".into(),
                ))
            }
        };
        let owned: BTreeSet<EventTypePartition> = topology
            .partitions
            .iter()
            .filter(|p| p.owned_by(ctx.session_id()))
            .map(|p| p.key())
            .collect();

        let gone: Vec<EventTypePartition> =
            self.assigned.difference(&owned).cloned().collect();
        for key in gone {
            debug!(partition = %key, "partition no longer owned by this session");
            self.uncommitted_offsets.remove(&key);
            if let Some(mut listener) = self.offset_listeners.remove(&key) {
                if let Err(err) = listener.close() {
                    warn!(partition = %key, error = %err, "failed to close offset watch");
                }
            }
        }

        let added: Vec<EventTypePartition> =
            owned.difference(&self.assigned).cloned().collect();
        self.assigned = owned;
        for key in added {
            let handle = ctx.handle().clone();
            let watched = key.clone();
            let listener = ctx
                .client()
                .subscribe_for_offset_changes(
                    &key,
                    Arc::new(move || {
                        handle.add_task(SessionTask::OffsetChanged(watched.clone()))
                    }),
                )
                .await?;
            self.offset_listeners.insert(key.clone(), listener);
            self.react_on_offset(ctx, &key).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_offset_changed(
        &mut self,
        ctx: &mut StreamingContext,
        key: EventTypePartition,
    ) -> Result<()> {
        let Some(listener) = self.offset_listeners.get_mut(&key) else {
            // The partition moved away; a late watch event.
            return Ok(());
        };
        listener.refresh().await?;
        self.react_on_offset(ctx, &key).await
    }

    async fn react_on_offset(
        &mut self,
        ctx: &mut StreamingContext,
        key: &EventTypePartition,
    ) -> Result<()> {
        let raw = ctx.client().get_offset(key).await?;
        let committed = ctx.cursor_converter().convert(key, &raw)?;
        let caught_up = self
            .uncommitted_offsets
            .get(key)
            .and_then(|streamed| streamed.partial_cmp(&committed))
            .is_some_and(|ordering| ordering.is_le());
        if caught_up {
            debug!(partition = %key, offset = %committed.offset, "commit observed");
            self.uncommitted_offsets.remove(key);
            self.last_commit_at = Instant::now();
        }
        Ok(())
    }

    pub(crate) fn on_position_streamed(
        &mut self,
        ctx: &mut StreamingContext,
        cursor: Cursor,
    ) -> Result<()> {
        if !ctx.is_connection_ready() {
            self.on_close_requested(ctx);
            return Ok(());
        }
        let key = cursor.key();
        if !self.assigned.contains(&key) {
            warn!(partition = %key, "streamed position for a partition this session does not own");
            return Ok(());
        }
        match self.uncommitted_offsets.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(cursor);
            }
            Entry::Occupied(mut entry) => {
                let advanced = entry
                    .get()
                    .partial_cmp(&cursor)
                    .is_some_and(|ordering| ordering.is_lt());
                if advanced {
                    entry.insert(cursor);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn on_close_requested(&mut self, ctx: &mut StreamingContext) {
        if self.closing_requested {
            return;
        }
        self.closing_requested = true;
        info!(
            uncommitted = self.uncommitted_offsets.len(),
            "closing stream, waiting for outstanding commits"
        );
        ctx.handle().switch_state(State::Closing(ClosingState::new()));
    }

    /// Closes this state's watches and leaves the uncommitted snapshot
    /// behind for the closing protocol.
    pub(crate) fn on_exit(&mut self, ctx: &mut StreamingContext) {
        for (key, mut listener) in self.offset_listeners.drain() {
            if let Err(err) = listener.close() {
                warn!(partition = %key, error = %err, "failed to close offset watch");
            }
        }
        if let Some(mut listener) = self.topology_listener.take() {
            if let Err(err) = listener.close() {
                warn!(error = %err, "failed to close topology watch");
            }
        }
        ctx.set_handoff(ClosingHandoff {
            uncommitted_offsets: std::mem::take(&mut self.uncommitted_offsets),
            last_commit_at: self.last_commit_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StreamingContextBuilder;
    use crate::coordination::memory::InMemoryCoordination;
    use crate::coordination::CoordinationClient;
    use crate::model::{Partition, PartitionState, Session, StreamParameters};
    use crate::output::ChannelOutput;

    fn partition(event_type: &str, id: &str, session: &str) -> Partition {
        Partition {
            event_type: event_type.into(),
            partition: id.into(),
            session: Some(session.into()),
            state: PartitionState::Assigned,
        }
    }

    async fn streaming_context(
        store: &InMemoryCoordination,
        partitions: &[Partition],
    ) -> (crate::context::StreamingContext, crate::context::SessionHandle) {
        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(partitions)
            .await
            .unwrap();
        drop(guard);

        let (output, _frames) = ChannelOutput::new();
        let (mut context, handle) = StreamingContextBuilder::new(
            Session::new("session-1", 1),
            StreamParameters::default(),
            Arc::new(store.clone()),
            Box::new(output),
        )
        .build();
        handle.switch_state(State::Streaming(StreamingState::new()));
        context.drain_tasks().await;
        assert_eq!(context.state_name(), "streaming");
        (context, handle)
    }

    #[tokio::test]
    async fn test_commit_clears_uncommitted_position() {
        let store = InMemoryCoordination::new();
        let key = EventTypePartition::new("orders", "0");
        let (mut context, handle) =
            streaming_context(&store, &[partition("orders", "0", "session-1")]).await;

        handle.record_streamed_position(Cursor::new("orders", "0", "000000000000000010"));
        context.drain_tasks().await;

        // Client commits up to the streamed position.
        store.put_offset(&key, "10");
        context.drain_tasks().await;

        // A graceful close now has nothing to wait for.
        handle.request_close();
        context.drain_tasks().await;
        assert_eq!(context.state_name(), "dead");
    }

    #[tokio::test]
    async fn test_position_for_unowned_partition_is_ignored() {
        let store = InMemoryCoordination::new();
        let (mut context, handle) =
            streaming_context(&store, &[partition("orders", "0", "session-1")]).await;

        handle.record_streamed_position(Cursor::new("payments", "7", "000000000000000001"));
        handle.request_close();
        context.drain_tasks().await;

        // Nothing tracked for the foreign partition, so the close is clean
        // and immediate.
        assert_eq!(context.state_name(), "dead");
    }

    #[tokio::test]
    async fn test_partition_moved_away_drops_local_tracking() {
        let store = InMemoryCoordination::new();
        let key = EventTypePartition::new("orders", "0");
        let (mut context, handle) =
            streaming_context(&store, &[partition("orders", "0", "session-1")]).await;

        handle.record_streamed_position(Cursor::new("orders", "0", "000000000000000010"));
        context.drain_tasks().await;

        // The store reassigns the partition to another session entirely.
        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[partition("orders", "0", "session-2")])
            .await
            .unwrap();
        drop(guard);
        context.drain_tasks().await;

        // No offset watch left for the moved partition.
        store.put_offset(&key, "10");
        context.drain_tasks().await;

        handle.request_close();
        context.drain_tasks().await;
        assert_eq!(context.state_name(), "dead");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout_initiates_graceful_close() {
        let store = InMemoryCoordination::new();
        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[partition("orders", "0", "session-1")])
            .await
            .unwrap();
        drop(guard);

        let (output, mut frames) = ChannelOutput::new();
        let (mut context, handle) = StreamingContextBuilder::new(
            Session::new("session-1", 1),
            StreamParameters {
                stream_timeout: Some(std::time::Duration::from_secs(30)),
                ..StreamParameters::default()
            },
            Arc::new(store.clone()),
            Box::new(output),
        )
        .build();

        handle.switch_state(State::Streaming(StreamingState::new()));
        context.drain_tasks().await;
        assert_eq!(context.state_name(), "streaming");

        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        context.drain_tasks().await;

        assert_eq!(context.state_name(), "dead");
        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.status, crate::output::CloseStatus::Closed);
    }
}
