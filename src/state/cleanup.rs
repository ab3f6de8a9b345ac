//! Terminal teardown. Safe to enter from any state, including from itself:
//! everything here is best-effort and idempotent, and the terminal frame is
//! written at most once per stream.

use tracing::{error, warn};

use crate::context::StreamingContext;
use crate::error::{Error, Result};
use crate::state::State;

pub(crate) struct CleanupState {
    error: Option<Error>,
}

impl CleanupState {
    pub(crate) fn clean() -> Self {
        CleanupState { error: None }
    }

    pub(crate) fn failed(error: Error) -> Self {
        CleanupState { error: Some(error) }
    }

    pub(crate) async fn on_enter(&mut self, ctx: &mut StreamingContext) -> Result<()> {
        if let Some(err) = &self.error {
            error!(error = %err, "terminating stream after error");
        }
        // A handoff that never reached the closing protocol is dropped here;
        // unregistering the session lets the rebalancer reassign whatever
        // this session still held.
        let _ = ctx.take_handoff();

        ctx.unregister_authorization_updates();
        if let Err(err) = ctx.unregister_session().await {
            warn!(error = %err, "failed to unregister session during cleanup");
        }
        ctx.write_terminal_frame(self.error.take());
        ctx.handle().switch_state(State::Dead);
        Ok(())
    }
}
