//! Per-session coordinator: owns the task queue, the current state and the
//! single-consumer loop that serializes every state transition and callback.
//!
//! All mutations of per-session data happen on the loop. External signals
//! (watch callbacks, timer fires, the shutdown token, the transport layer)
//! only enqueue [`SessionTask`]s through a cloned [`SessionHandle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AllowAll, AuthorizationValidator};
use crate::coordination::{CoordinationClient, DataWatch, Watch};
use crate::cursor::{CursorConverter, PaddedOffsetConverter};
use crate::error::Result;
use crate::model::{Cursor, EventTypePartition, Session, StreamParameters};
use crate::output::{SubscriptionOutput, TerminalFrame};
use crate::rebalance::{NoopRebalancer, Rebalancer};
use crate::state::{CleanupState, StartingState, State};

/// The dequeue wakes up at least this often even with nothing to run.
const TASK_POLL_TIMEOUT: Duration = Duration::from_secs(3600);

/// A unit of work on the session's task queue. The loop is the only consumer;
/// watch callbacks, timers and the transport are the producers.
pub(crate) enum SessionTask {
    SwitchState(State),
    Rebalance,
    CheckAuthorization,
    TopologyChanged,
    OffsetChanged(EventTypePartition),
    PositionStreamed(Cursor),
    CloseRequested,
}

impl SessionTask {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SessionTask::SwitchState(_) => "switch_state",
            SessionTask::Rebalance => "rebalance",
            SessionTask::CheckAuthorization => "check_authorization",
            SessionTask::TopologyChanged => "topology_changed",
            SessionTask::OffsetChanged(_) => "offset_changed",
            SessionTask::PositionStreamed(_) => "position_streamed",
            SessionTask::CloseRequested => "close_requested",
        }
    }
}

/// Data the streaming state leaves behind for the closing protocol: the
/// offsets streamed to the client but not yet committed, and when the last
/// commit was observed.
pub(crate) struct ClosingHandoff {
    pub(crate) uncommitted_offsets: HashMap<EventTypePartition, Cursor>,
    pub(crate) last_commit_at: Instant,
}

/// Cloneable producer side of the session's task queue. This is what the
/// transport layer holds on to, and what watch handlers capture.
#[derive(Clone)]
pub struct SessionHandle {
    tasks: mpsc::UnboundedSender<SessionTask>,
    connection_ready: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn add_task(&self, task: SessionTask) {
        if self.tasks.send(task).is_err() {
            debug!("task dropped, session loop has already stopped");
        }
    }

    /// Enqueues `task` after at least `delay` has elapsed.
    pub(crate) fn schedule_task(&self, task: SessionTask, delay: Duration) {
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tasks.send(task);
        });
    }

    /// Enqueues a state switch. The switch itself runs as a task, never
    /// synchronously.
    pub(crate) fn switch_state(&self, state: State) {
        self.add_task(SessionTask::SwitchState(state));
    }

    /// Records that events up to `cursor` have been sent to the client
    /// without a commit being observed yet.
    pub fn record_streamed_position(&self, cursor: Cursor) {
        self.add_task(SessionTask::PositionStreamed(cursor));
    }

    /// Asks the session to close gracefully, waiting for outstanding commits
    /// under the commit-timeout deadline.
    pub fn request_close(&self) {
        self.add_task(SessionTask::CloseRequested);
    }

    /// Marks the client connection as gone and initiates a close.
    pub fn connection_lost(&self) {
        self.connection_ready.store(false, Ordering::SeqCst);
        self.add_task(SessionTask::CloseRequested);
    }
}

pub struct StreamingContextBuilder {
    session: Session,
    parameters: StreamParameters,
    client: Arc<dyn CoordinationClient>,
    output: Box<dyn SubscriptionOutput>,
    cursor_converter: Arc<dyn CursorConverter>,
    rebalancer: Arc<dyn Rebalancer>,
    authorization: Arc<dyn AuthorizationValidator>,
    shutdown: CancellationToken,
}

impl StreamingContextBuilder {
    /// Create a new builder with mandatory fields.
    pub fn new(
        session: Session,
        parameters: StreamParameters,
        client: Arc<dyn CoordinationClient>,
        output: Box<dyn SubscriptionOutput>,
    ) -> Self {
        StreamingContextBuilder {
            session,
            parameters,
            client,
            output,
            cursor_converter: Arc::new(PaddedOffsetConverter),
            rebalancer: Arc::new(NoopRebalancer),
            authorization: Arc::new(AllowAll),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cursor_converter(mut self, converter: Arc<dyn CursorConverter>) -> Self {
        self.cursor_converter = converter;
        self
    }

    pub fn rebalancer(mut self, rebalancer: Arc<dyn Rebalancer>) -> Self {
        self.rebalancer = rebalancer;
        self
    }

    pub fn authorization(mut self, validator: Arc<dyn AuthorizationValidator>) -> Self {
        self.authorization = validator;
        self
    }

    /// Token whose cancellation terminates the stream through cleanup.
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    #[must_use]
    pub fn build(self) -> (StreamingContext, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            tasks: tx,
            connection_ready: Arc::new(AtomicBool::new(true)),
        };
        let context = StreamingContext {
            session: self.session,
            parameters: self.parameters,
            client: self.client,
            output: self.output,
            cursor_converter: self.cursor_converter,
            rebalancer: self.rebalancer,
            authorization: self.authorization,
            shutdown: self.shutdown,
            tasks: rx,
            handle: handle.clone(),
            current: State::Dead,
            session_list_listener: None,
            authorization_listener: None,
            handoff: None,
            terminal_sent: false,
        };
        (context, handle)
    }
}

/// Controller of one client stream. Created per stream, runs until the
/// sentinel Dead state, then discarded.
pub struct StreamingContext {
    session: Session,
    parameters: StreamParameters,
    client: Arc<dyn CoordinationClient>,
    output: Box<dyn SubscriptionOutput>,
    cursor_converter: Arc<dyn CursorConverter>,
    rebalancer: Arc<dyn Rebalancer>,
    authorization: Arc<dyn AuthorizationValidator>,
    shutdown: CancellationToken,
    tasks: mpsc::UnboundedReceiver<SessionTask>,
    handle: SessionHandle,
    current: State,
    session_list_listener: Option<Box<dyn DataWatch<Vec<String>>>>,
    authorization_listener: Option<Box<dyn Watch>>,
    handoff: Option<ClosingHandoff>,
    terminal_sent: bool,
}

impl StreamingContext {
    /// Runs the session to completion: installs the shutdown hook, enters
    /// Starting and consumes the task queue until the Dead state.
    pub async fn stream(mut self) {
        let shutdown_hook = {
            let token = self.shutdown.clone();
            let handle = self.handle.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                info!("shutdown signal received, terminating subscription gracefully");
                handle.switch_state(State::Cleanup(CleanupState::clean()));
            })
        };

        self.handle.switch_state(State::Starting(StartingState::new()));
        loop {
            match tokio::time::timeout(TASK_POLL_TIMEOUT, self.tasks.recv()).await {
                Ok(Some(task)) => self.step(task).await,
                // We hold a sender ourselves, so this only happens if the
                // handle ever stops being kept alive here.
                Ok(None) => break,
                // Spurious wake: nothing to run.
                Err(_) => continue,
            }
            // The session starts out in the Dead placeholder, so the exit
            // condition is only checked once a task has run.
            if matches!(self.current, State::Dead) {
                break;
            }
        }
        shutdown_hook.abort();
        info!(session = %self.session.id, "session loop finished");
    }

    /// Runs one task, converting any failure into a switch to Cleanup
    /// carrying the error.
    async fn step(&mut self, task: SessionTask) {
        let name = task.name();
        if let Err(err) = self.run_task(task).await {
            error!(task = name, error = %err, "failed to process task, switching to cleanup");
            self.handle
                .switch_state(State::Cleanup(CleanupState::failed(err)));
        }
    }

    async fn run_task(&mut self, task: SessionTask) -> Result<()> {
        match task {
            SessionTask::SwitchState(next) => self.switch_state_now(next).await,
            SessionTask::Rebalance => self.rebalance().await,
            SessionTask::CheckAuthorization => self.authorization.authorize_read(),
            task => {
                // The state is taken out of its slot so that it and the
                // context can be borrowed mutably at the same time. Nothing
                // observes `current` while a task runs: switches are
                // themselves enqueued, never synchronous.
                let mut state = std::mem::replace(&mut self.current, State::Dead);
                let result = state.handle_task(self, task).await;
                self.current = state;
                result
            }
        }
    }

    /// Body of the switch task: `on_exit` of the old state (never allowed to
    /// propagate), then `on_enter` of the new one. An `on_enter` failure
    /// bubbles to the loop, which switches to Cleanup with the error.
    async fn switch_state_now(&mut self, next: State) -> Result<()> {
        let mut old = std::mem::replace(&mut self.current, State::Dead);
        info!(from = old.name(), to = next.name(), "switching state");
        old.on_exit(self).await;
        drop(old);

        let mut entered = next;
        let result = entered.on_enter(self).await;
        self.current = entered;
        result
    }

    /// Re-reads the session list and lets the injected rebalancer write a new
    /// assignment, all under the subscription lock. No assignment decisions
    /// are made outside the lock.
    async fn rebalance(&mut self) -> Result<()> {
        let Some(listener) = self.session_list_listener.as_mut() else {
            // The session is already unregistered; a late watch event.
            return Ok(());
        };
        // Re-arms the session-list watch; the authoritative read happens
        // under the lock below.
        listener.get_data().await?;

        let _guard = self.client.lock().await?;
        let sessions = self.client.list_sessions().await?;
        let partitions = self.client.list_partitions().await?;
        let changeset = self.rebalancer.rebalance(&sessions, &partitions);
        if !changeset.is_empty() {
            info!(changes = changeset.len(), "applying rebalance changeset");
            self.client.update_partitions_configuration(&changeset).await?;
        }
        Ok(())
    }

    /// Installs the session-list watch (which triggers rebalancing) and then
    /// registers this session, so our own arrival is the first trigger.
    pub(crate) async fn register_session(&mut self) -> Result<()> {
        info!(session = %self.session.id, "registering session");
        let handle = self.handle.clone();
        let listener = self
            .client
            .subscribe_for_session_list_changes(Arc::new(move || {
                handle.add_task(SessionTask::Rebalance)
            }))
            .await?;
        self.session_list_listener = Some(listener);
        self.client.register_session(&self.session).await
    }

    /// Idempotent: only acts if the session-list watch is still installed.
    pub(crate) async fn unregister_session(&mut self) -> Result<()> {
        if let Some(mut listener) = self.session_list_listener.take() {
            info!(session = %self.session.id, "unregistering session");
            if let Err(err) = listener.close() {
                warn!(error = %err, "failed to close session list watch");
            }
            self.client.unregister_session(&self.session).await?;
        }
        Ok(())
    }

    /// Subscribes for authorization-rule changes; each change re-checks read
    /// access on the session loop.
    pub(crate) fn register_for_authorization_updates(&mut self) -> Result<()> {
        debug_assert!(self.authorization_listener.is_none());
        let handle = self.handle.clone();
        let watch = self.authorization.subscribe_for_changes(Arc::new(move || {
            handle.add_task(SessionTask::CheckAuthorization)
        }))?;
        self.authorization_listener = Some(watch);
        Ok(())
    }

    /// Initial read-access check, run before the session joins the
    /// subscription. Later re-checks arrive as tasks from the watch.
    pub(crate) fn check_access_authorized(&self) -> Result<()> {
        self.authorization.authorize_read()
    }

    pub(crate) fn unregister_authorization_updates(&mut self) {
        if let Some(mut watch) = self.authorization_listener.take() {
            if let Err(err) = watch.close() {
                error!(error = %err, "failed to cancel authorization watch");
            }
        }
    }

    /// Writes the stream's terminal frame. Only the first call has an
    /// effect, so re-entering Cleanup keeps the first error.
    pub(crate) fn write_terminal_frame(&mut self, error: Option<crate::error::Error>) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        self.output.stream_closed(TerminalFrame::new(error.as_ref()));
    }

    pub(crate) fn set_handoff(&mut self, handoff: ClosingHandoff) {
        self.handoff = Some(handoff);
    }

    pub(crate) fn take_handoff(&mut self) -> Option<ClosingHandoff> {
        self.handoff.take()
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session.id
    }

    pub(crate) fn parameters(&self) -> &StreamParameters {
        &self.parameters
    }

    pub(crate) fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub(crate) fn cursor_converter(&self) -> &Arc<dyn CursorConverter> {
        &self.cursor_converter
    }

    pub(crate) fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub(crate) fn is_connection_ready(&self) -> bool {
        self.handle.connection_ready.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl StreamingContext {
    /// Runs queued tasks until the queue is empty, with the loop's error
    /// conversion. Lets tests drive the session deterministically without a
    /// background loop.
    pub(crate) async fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            self.step(task).await;
        }
    }

    pub(crate) fn state_name(&self) -> &'static str {
        self.current.name()
    }
}
