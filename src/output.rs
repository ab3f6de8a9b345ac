//! Client-facing stream output. The streaming core only needs the terminal
//! frame: exactly one is written per stream, either a clean close or the
//! first fatal error encountered.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Error;

/// The last frame written to a client stream.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TerminalFrame {
    pub status: CloseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Closed,
    Failed,
}

impl TerminalFrame {
    pub fn new(error: Option<&Error>) -> Self {
        match error {
            None => TerminalFrame {
                status: CloseStatus::Closed,
                error_kind: None,
                error_message: None,
                closed_at: Utc::now(),
            },
            Some(err) => TerminalFrame {
                status: CloseStatus::Failed,
                error_kind: Some(err.kind().to_string()),
                error_message: Some(err.to_string()),
                closed_at: Utc::now(),
            },
        }
    }
}

/// Sink consumed by the cleanup path. Implementations belong to the transport
/// layer; writes must not block the task loop.
pub trait SubscriptionOutput: Send {
    fn stream_closed(&mut self, frame: TerminalFrame);
}

/// Output that forwards frames into a channel, for embedding and tests.
pub struct ChannelOutput {
    frames: mpsc::UnboundedSender<TerminalFrame>,
}

impl ChannelOutput {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TerminalFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelOutput { frames: tx }, rx)
    }
}

impl SubscriptionOutput for ChannelOutput {
    fn stream_closed(&mut self, frame: TerminalFrame) {
        if self.frames.send(frame).is_err() {
            warn!("terminal frame dropped, client side of the output is gone");
        }
    }
}
