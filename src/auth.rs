//! Read-authorization checks for a subscription stream.
//!
//! The validator is consulted when the session starts and again whenever the
//! authorization rules change; a denied re-check terminates the stream
//! through the cleanup path.

use crate::coordination::{Watch, WatchHandler};
use crate::error::Result;

pub trait AuthorizationValidator: Send + Sync {
    /// Checks that the consumer may still read from the subscription.
    fn authorize_read(&self) -> Result<()>;

    /// Installs a watch that fires when the authorization rules change. The
    /// handler must only enqueue a task.
    fn subscribe_for_changes(&self, handler: WatchHandler) -> Result<Box<dyn Watch>>;
}

/// Validator that allows everything and never fires a change.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

struct NoopWatch;

impl Watch for NoopWatch {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl AuthorizationValidator for AllowAll {
    fn authorize_read(&self) -> Result<()> {
        Ok(())
    }

    fn subscribe_for_changes(&self, _handler: WatchHandler) -> Result<Box<dyn Watch>> {
        Ok(Box::new(NoopWatch))
    }
}
