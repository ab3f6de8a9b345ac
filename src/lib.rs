//! Per-session streaming core of a partitioned event-subscription service.
//!
//! A subscription has many partitions spread over many concurrent client
//! sessions. This crate owns one session's streaming lifecycle: a
//! single-consumer task queue serializing every state transition and
//! callback, the lifecycle states (starting, streaming, closing, cleanup)
//! and the closing protocol that waits, under a deadline, for the client to
//! commit its outstanding cursors before partitions are handed off through
//! the coordination store.
//!
//! The transport layer builds a [`StreamingContext`] per client stream,
//! drives it with the returned [`SessionHandle`] and runs
//! [`StreamingContext::stream`] to completion.

pub use crate::error::{Error, Result};

pub mod auth;
pub mod coordination;
pub mod cursor;
pub mod model;
pub mod output;
pub mod rebalance;

mod context;
mod error;
mod state;

pub use crate::context::{SessionHandle, StreamingContext, StreamingContextBuilder};
