//! Domain records shared between the coordinator, the states and the
//! coordination store: partition identity, cursors, topology snapshots and
//! session descriptors.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a partition inside a subscription, the pair of event type and
/// partition id. Ordered lexicographically, event type first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventTypePartition {
    pub event_type: String,
    pub partition: String,
}

impl EventTypePartition {
    pub fn new(event_type: impl Into<String>, partition: impl Into<String>) -> Self {
        EventTypePartition {
            event_type: event_type.into(),
            partition: partition.into(),
        }
    }
}

impl fmt::Display for EventTypePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event_type, self.partition)
    }
}

/// A position within one partition's event sequence.
///
/// The `offset` field is kept in normalized form (see
/// [`crate::cursor::CursorConverter`]) so that ordering within a partition is
/// a plain string comparison. Cursors from different partitions are
/// incomparable and `partial_cmp` returns `None` for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub event_type: String,
    pub partition: String,
    pub offset: String,
}

impl Cursor {
    pub fn new(
        event_type: impl Into<String>,
        partition: impl Into<String>,
        offset: impl Into<String>,
    ) -> Self {
        Cursor {
            event_type: event_type.into(),
            partition: partition.into(),
            offset: offset.into(),
        }
    }

    pub fn key(&self) -> EventTypePartition {
        EventTypePartition::new(self.event_type.clone(), self.partition.clone())
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.event_type != other.event_type || self.partition != other.partition {
            return None;
        }
        Some(self.offset.cmp(&other.offset))
    }
}

/// Assignment lifecycle of a partition within the topology node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    Assigned,
    Reassigning,
    Unassigned,
}

/// One partition record of the topology node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub event_type: String,
    pub partition: String,
    /// Owning session id; `None` only for `Unassigned` records.
    pub session: Option<String>,
    pub state: PartitionState,
}

impl Partition {
    pub fn key(&self) -> EventTypePartition {
        EventTypePartition::new(self.event_type.clone(), self.partition.clone())
    }

    /// Whether this record is currently owned by the given session.
    pub fn owned_by(&self, session_id: &str) -> bool {
        self.session.as_deref() == Some(session_id)
    }
}

/// Snapshot of the subscription's partition-to-session assignment, together
/// with a monotonic version bumped on every write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub version: u64,
    pub partitions: Vec<Partition>,
}

/// A single connected client stream's identity within the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Relative share of partitions this session should receive on rebalance.
    pub weight: u64,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, weight: u64) -> Self {
        Session {
            id: id.into(),
            weight,
            connected_at: Utc::now(),
        }
    }
}

/// Client-facing limits of one stream.
#[derive(Debug, Clone)]
pub struct StreamParameters {
    /// Maximum time to wait for outstanding commits before partitions are
    /// released forcibly while closing.
    pub commit_timeout: Duration,
    /// Total stream duration after which a graceful close is initiated.
    /// `None` streams until the client disconnects.
    pub stream_timeout: Option<Duration>,
}

impl Default for StreamParameters {
    fn default() -> Self {
        StreamParameters {
            commit_timeout: Duration::from_secs(60),
            stream_timeout: None,
        }
    }
}
