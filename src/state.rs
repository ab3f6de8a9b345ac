//! Session lifecycle states. The coordinator only sees the closed variant
//! set and the `on_enter`/`on_exit`/`handle_task` capabilities; everything
//! else is state-local.

use tracing::debug;

use crate::context::{SessionTask, StreamingContext};
use crate::error::Result;

mod cleanup;
mod closing;
mod starting;
mod streaming;

pub(crate) use cleanup::CleanupState;
pub(crate) use closing::ClosingState;
pub(crate) use starting::StartingState;
pub(crate) use streaming::StreamingState;

pub(crate) enum State {
    Starting(StartingState),
    Streaming(StreamingState),
    Closing(ClosingState),
    Cleanup(CleanupState),
    /// Sentinel; entering it ends the task loop.
    Dead,
}

impl State {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            State::Starting(_) => "starting",
            State::Streaming(_) => "streaming",
            State::Closing(_) => "closing",
            State::Cleanup(_) => "cleanup",
            State::Dead => "dead",
        }
    }

    pub(crate) async fn on_enter(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        match self {
            State::Starting(state) => state.on_enter(ctx).await,
            State::Streaming(state) => state.on_enter(ctx).await,
            State::Closing(state) => state.on_enter(ctx).await,
            State::Cleanup(state) => state.on_enter(ctx).await,
            State::Dead => Ok(()),
        }
    }

    /// Never propagates an error: each state's `on_exit` logs its own
    /// failures so the next state can always enter.
    pub(crate) async fn on_exit(&mut self, ctx: &mut StreamingContext) {
        match self {
            State::Starting(state) => state.on_exit(ctx),
            State::Streaming(state) => state.on_exit(ctx),
            State::Closing(state) => state.on_exit(ctx).await,
            State::Cleanup(_) | State::Dead => {}
        }
    }

    /// Dispatches a state-routed task. Tasks that do not apply to the
    /// current state are late deliveries and are dropped.
    pub(crate) async fn handle_task(
        &mut self,
        ctx: &mut StreamingContext,
        task: SessionTask,
    ) -> Result<()> {
        match (self, task) {
            (State::Starting(state), SessionTask::TopologyChanged) => {
                state.on_topology_changed(ctx).await
            }
            (State::Starting(_), SessionTask::CloseRequested) => {
                // Nothing assigned yet, nothing to wait for.
                ctx.handle().switch_state(State::Cleanup(CleanupState::clean()));
                Ok(())
            }
            (State::Streaming(state), SessionTask::TopologyChanged) => {
                state.on_topology_changed(ctx).await
            }
            (State::Streaming(state), SessionTask::OffsetChanged(key)) => {
                state.on_offset_changed(ctx, key).await
            }
            (State::Streaming(state), SessionTask::PositionStreamed(cursor)) => {
                state.on_position_streamed(ctx, cursor)
            }
            (State::Streaming(state), SessionTask::CloseRequested) => {
                state.on_close_requested(ctx);
                Ok(())
            }
            (State::Closing(state), SessionTask::TopologyChanged) => {
                state.on_topology_changed(ctx).await
            }
            (State::Closing(state), SessionTask::OffsetChanged(key)) => {
                state.on_offset_changed(ctx, key).await
            }
            (state, task) => {
                debug!(
                    state = state.name(),
                    task = task.name(),
                    "ignoring task in this state"
                );
                Ok(())
            }
        }
    }
}
