//! Closing protocol: the session is leaving and must release every partition
//! it holds. Partitions whose streamed position the client has not committed
//! yet are kept until the commit arrives or the commit timeout expires,
//! reacting live to topology and offset changes in the coordination store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{error, info};

use crate::context::{SessionTask, StreamingContext};
use crate::coordination::{DataWatch, OffsetWatch};
use crate::error::{Error, Result};
use crate::model::{Cursor, EventTypePartition, PartitionState, Topology};
use crate::state::{CleanupState, State};

pub(crate) struct ClosingState {
    /// Streamed positions that still lack a commit. Emptying this map
    /// completes the state.
    uncommitted_offsets: HashMap<EventTypePartition, Cursor>,
    /// Offset watches per partition we are still waiting on. Always a subset
    /// of `uncommitted_offsets`.
    listeners: HashMap<EventTypePartition, Box<dyn OffsetWatch>>,
    topology_listener: Option<Box<dyn DataWatch<Topology>>>,
}

impl ClosingState {
    pub(crate) fn new() -> Self {
        ClosingState {
            uncommitted_offsets: HashMap::new(),
            listeners: HashMap::new(),
            topology_listener: None,
        }
    }

    pub(crate) async fn on_enter(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        let last_commit_at = match ctx.take_handoff() {
            Some(handoff) => {
                self.uncommitted_offsets = handoff.uncommitted_offsets;
                handoff.last_commit_at
            }
            None => Instant::now(),
        };
        let time_to_wait = ctx
            .parameters()
            .commit_timeout
            .saturating_sub(last_commit_at.elapsed());

        if self.uncommitted_offsets.is_empty() || time_to_wait.is_zero() {
            ctx.handle().switch_state(State::Cleanup(CleanupState::clean()));
            return Ok(());
        }

        info!(
            partitions = self.uncommitted_offsets.len(),
            wait_ms = time_to_wait.as_millis() as u64,
            "waiting for outstanding commits before releasing partitions"
        );
        // The deadline switches to cleanup no matter what; once the state is
        // complete the late switch is a harmless cleanup-to-cleanup.
        ctx.handle().schedule_task(
            SessionTask::SwitchState(State::Cleanup(CleanupState::clean())),
            time_to_wait,
        );

        let handle = ctx.handle().clone();
        match ctx
            .client()
            .subscribe_for_topology_changes(Arc::new(move || {
                handle.add_task(SessionTask::TopologyChanged)
            }))
            .await
        {
            Ok(listener) => self.topology_listener = Some(listener),
            Err(err) => {
                ctx.handle()
                    .switch_state(State::Cleanup(CleanupState::failed(err)));
                return Ok(());
            }
        }
        self.react_on_topology_change(ctx).await
    }

    pub(crate) async fn on_topology_changed(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        if self.topology_listener.is_none() {
            return Err(Error::Internal(
                "topology watch must be installed when a topology change is delivered".into(),
            ));
        }
        self.react_on_topology_change(ctx).await
    }

    async fn react_on_topology_change(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        let topology = match self.topology_listener.as_mut() {
            Some(listener) => listener.get_data().await?,
            None => {
                return Err(Error::Internal(
                    "topology watch must be installed while closing".into(),
                ))
            }
        };
        let session_id = ctx.session_id().to_string();
        let owned: HashMap<EventTypePartition, PartitionState> = topology
            .partitions
            .iter()
            .filter(|p| p.owned_by(&session_id))
            .map(|p| (p.key(), p.state))
            .collect();

        // Select which partitions can be freed at once and which ones we
        // still have to watch for a commit.
        let mut free_right_now = BTreeSet::new();
        let mut add_listeners = BTreeSet::new();
        for (key, state) in &owned {
            if *state == PartitionState::Reassigning {
                if !self.uncommitted_offsets.contains_key(key) {
                    free_right_now.insert(key.clone());
                } else if !self.listeners.contains_key(key) {
                    add_listeners.insert(key.clone());
                }
            } else if self.uncommitted_offsets.contains_key(key)
                && !self.listeners.contains_key(key)
            {
                add_listeners.insert(key.clone());
            }
        }
        // Partitions the store no longer attributes to this session must be
        // dropped locally without further waiting.
        for key in self.uncommitted_offsets.keys() {
            if !owned.contains_key(key) {
                free_right_now.insert(key.clone());
            }
        }

        self.free_partitions(ctx, free_right_now.into_iter().collect())
            .await?;
        for key in add_listeners {
            self.register_listener(ctx, key).await?;
        }
        self.try_complete_state(ctx);
        Ok(())
    }

    /// Watches one partition's offset node, then immediately evaluates the
    /// current offset in case the client is already caught up.
    async fn register_listener(
        &mut self,
        ctx: &mut StreamingContext,
        key: EventTypePartition,
    ) -> Result<()> {
        let handle = ctx.handle().clone();
        let watched = key.clone();
        let listener = ctx
            .client()
            .subscribe_for_offset_changes(
                &key,
                Arc::new(move || handle.add_task(SessionTask::OffsetChanged(watched.clone()))),
            )
            .await?;
        self.listeners.insert(key.clone(), listener);
        self.react_on_offset(ctx, &key).await
    }

    pub(crate) async fn on_offset_changed(
        &mut self,
        ctx: &mut StreamingContext,
        key: EventTypePartition,
    ) -> Result<()> {
        // Events for partitions that were already freed are ignored.
        let Some(listener) = self.listeners.get_mut(&key) else {
            return Ok(());
        };
        listener.refresh().await?;
        self.react_on_offset(ctx, &key).await
    }

    /// The partition is committed once the committed offset is at or past
    /// the position streamed to the client.
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
            self.free_partitions(ctx, vec![key.clone()]).await?;
        }
        self.try_complete_state(ctx);
        Ok(())
    }

    fn try_complete_state(&self, ctx: &mut StreamingContext) {
        if self.uncommitted_offsets.is_empty() {
            ctx.handle().switch_state(State::Cleanup(CleanupState::clean()));
        }
    }

    /// Drops the given partitions from the local maps, cancels their offset
    /// watches and hands them off with one atomic transfer under the
    /// subscription lock. The first watch-cancel failure is remembered and
    /// returned after the transfer, so the handoff itself always runs.
    async fn free_partitions(
        &mut self,
        ctx: &mut StreamingContext,
        keys: Vec<EventTypePartition>,
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut first_cancel_error: Option<Error> = None;
        for key in &keys {
            self.uncommitted_offsets.remove(key);
            if let Some(mut listener) = self.listeners.remove(key) {
                if let Err(err) = listener.close() {
                    error!(partition = %key, error = %err, "failed to cancel offset watch");
                    first_cancel_error.get_or_insert(Error::ListenerCancel(format!(
                        "offset watch for {key}: {err}"
                    )));
                }
            }
        }

        info!(partitions = keys.len(), "releasing partitions");
        {
            let _guard = ctx.client().lock().await?;
            ctx.client().transfer(ctx.session_id(), &keys).await?;
        }

        match first_cancel_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Releases everything still tracked. Failures are logged, never
    /// propagated, so the next state can always enter.
    pub(crate) async fn on_exit(&mut self, ctx: &mut StreamingContext) {
        let mut keys: BTreeSet<EventTypePartition> =
            self.uncommitted_offsets.keys().cloned().collect();
        keys.extend(self.listeners.keys().cloned());
        if let Err(err) = self
            .free_partitions(ctx, keys.into_iter().collect())
            .await
        {
            error!(error = %err, "failed to transfer partitions when leaving closing state");
        }
        if let Some(mut listener) = self.topology_listener.take() {
            if let Err(err) = listener.close() {
                error!(error = %err, "failed to close topology watch");
            }
        }
    }
}
