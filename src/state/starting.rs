//! First lifecycle state: registers the session, installs the rebalance and
//! authorization hooks and waits until the rebalancer assigns this session
//! its first partition.

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::{SessionTask, StreamingContext};
use crate::coordination::DataWatch;
use crate::error::{Error, Result};
use crate::model::{PartitionState, Topology};
use crate::state::{State, StreamingState};

pub(crate) struct StartingState {
    topology_listener: Option<Box<dyn DataWatch<Topology>>>,
}

impl StartingState {
    pub(crate) fn new() -> Self {
        StartingState {
            topology_listener: None,
        }
    }

    pub(crate) async fn on_enter(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        ctx.check_access_authorized()?;
        ctx.register_session().await?;
        ctx.register_for_authorization_updates()?;

        let handle = ctx.handle().clone();
        self.topology_listener = Some(
            ctx.client()
                .subscribe_for_topology_changes(Arc::new(move || {
                    handle.add_task(SessionTask::TopologyChanged)
                }))
                .await?,
        );
        self.react_on_topology(ctx).await
    }

    pub(crate) async fn on_topology_changed(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        if self.topology_listener.is_none() {
            return Err(Error::Internal(
                "topology watch must be installed when a topology change is delivered".into(),
            ));
        }
        self.react_on_topology(ctx).await
    }

    async fn react_on_topology(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        let topology = match self.topology_listener.as_mut() {
            Some(listener) => listener.get_data().await?,
            None => {
                return Err(Error::Internal(
                    "topology watch must be installed while waiting for assignment".into(),
                ))
            }
        };
        let assigned = topology
            .partitions
            .iter()
            .filter(|p| p.owned_by(ctx.session_id()) && p.state == PartitionState::Assigned)
            .count();
        if assigned > 0 {
            info!(partitions = assigned, "partitions assigned, starting to stream");
            ctx.handle()
                .switch_state(State::Streaming(StreamingState::new()));
        }
        Ok(())
    }

    pub(crate) fn on_exit(&mut self, _ctx: &mut StreamingContext) {
        if let Some(mut listener) = self.topology_listener.take() {
            if let Err(err) = listener.close() {
                warn!(error = %err, "failed to close topology watch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StreamingContextBuilder;
    use crate::coordination::memory::InMemoryCoordination;
    use crate::coordination::CoordinationClient;
    use crate::model::{Partition, Session, StreamParameters};
    use crate::output::ChannelOutput;
    use std::sync::Arc;

    fn partition(id: &str, session: Option<&str>, state: PartitionState) -> Partition {
        Partition {
            event_type: "orders".into(),
            partition: id.into(),
            session: session.map(Into::into),
            state,
        }
    }

    #[tokio::test]
    async fn test_waits_for_assignment_then_streams() {
        let store = InMemoryCoordination::new();
        let (output, _frames) = ChannelOutput::new();
        let (mut context, handle) = StreamingContextBuilder::new(
            Session::new("session-1", 1),
            StreamParameters::default(),
            Arc::new(store.clone()),
            Box::new(output),
        )
        .build();

        handle.switch_state(State::Starting(StartingState::new()));
        context.drain_tasks().await;
        assert_eq!(context.state_name(), "starting");
        let registered: Vec<String> = store
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(registered, vec!["session-1".to_string()]);

        let guard = store.lock().await.unwrap();
        store
            .update_partitions_configuration(&[partition(
                "0",
                Some("session-1"),
                PartitionState::Assigned,
            )])
            .await
            .unwrap();
        drop(guard);
        context.drain_tasks().await;

        assert_eq!(context.state_name(), "streaming");
    }

    #[tokio::test]
    async fn test_close_request_before_assignment_is_a_clean_exit() {
        let store = InMemoryCoordination::new();
        let (output, mut frames) = ChannelOutput::new();
        let (mut context, handle) = StreamingContextBuilder::new(
            Session::new("session-1", 1),
            StreamParameters::default(),
            Arc::new(store.clone()),
            Box::new(output),
        )
        .build();

        handle.switch_state(State::Starting(StartingState::new()));
        context.drain_tasks().await;
        handle.request_close();
        context.drain_tasks().await;

        assert_eq!(context.state_name(), "dead");
        assert!(store.list_sessions().await.unwrap().is_empty());
        assert_eq!(store.watch_count(), 0);
        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.status, crate::output::CloseStatus::Closed);
    }
}
