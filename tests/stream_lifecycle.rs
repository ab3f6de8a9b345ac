//! End-to-end lifecycle of one session: registration, rebalance-driven
//! assignment, streaming with commit tracking, graceful close waiting for
//! the outstanding commit, and teardown.

use std::sync::Arc;
use std::time::Duration;

use substream_core::coordination::memory::InMemoryCoordination;
use substream_core::coordination::CoordinationClient;
use substream_core::model::{
    Cursor, EventTypePartition, Partition, PartitionState, Session, StreamParameters,
};
use substream_core::output::{ChannelOutput, CloseStatus};
use substream_core::rebalance::Rebalancer;
use substream_core::StreamingContextBuilder;

/// Hands every unassigned partition to the first session. Enough for a
/// single-session subscription.
struct FirstSessionRebalancer;

impl Rebalancer for FirstSessionRebalancer {
    fn rebalance(&self, sessions: &[Session], partitions: &[Partition]) -> Vec<Partition> {
        let Some(first) = sessions.first() else {
            return Vec::new();
        };
        partitions
            .iter()
            .filter(|p| p.session.is_none())
            .map(|p| Partition {
                session: Some(first.id.clone()),
                state: PartitionState::Assigned,
                ..p.clone()
            })
            .collect()
    }
}

async fn wait_for_assignment(store: &InMemoryCoordination, session: &str) {
    for _ in 0..500 {
        let assigned = store
            .list_partitions()
            .await
            .unwrap()
            .first()
            .is_some_and(|p| p.session.as_deref() == Some(session));
        if assigned {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for the partition assignment");
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let store = InMemoryCoordination::new();
    let key = EventTypePartition::new("orders", "0");

    // One unconfigured partition; the rebalancer will assign it once the
    // session registers.
    let guard = store.lock().await.unwrap();
    store
        .update_partitions_configuration(&[Partition {
            event_type: "orders".into(),
            partition: "0".into(),
            session: None,
            state: PartitionState::Unassigned,
        }])
        .await
        .unwrap();
    drop(guard);

    let (output, mut frames) = ChannelOutput::new();
    let (context, handle) = StreamingContextBuilder::new(
        Session::new("session-1", 1),
        StreamParameters {
            commit_timeout: Duration::from_secs(5),
            stream_timeout: None,
        },
        Arc::new(store.clone()),
        Box::new(output),
    )
    .rebalancer(Arc::new(FirstSessionRebalancer))
    .build();
    let session_loop = tokio::spawn(context.stream());

    // Registration triggers the rebalance, which assigns the partition.
    wait_for_assignment(&store, "session-1").await;
    // Give the session a moment to observe the assignment and enter
    // streaming.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Stream up to offset 10 without a commit, then ask for a graceful
    // close.
    handle.record_streamed_position(Cursor::new("orders", "0", "000000000000000010"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.request_close();

    // The close waits for the outstanding commit instead of finishing.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        frames.try_recv().is_err(),
        "stream must keep waiting for the outstanding commit"
    );

    // The client catches up; the partition is released and the stream ends
    // cleanly, well before the commit timeout.
    store.put_offset(&key, "10");
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("terminal frame within the commit timeout")
        .expect("terminal frame expected");
    assert_eq!(frame.status, CloseStatus::Closed);

    tokio::time::timeout(Duration::from_secs(2), session_loop)
        .await
        .expect("session loop must finish")
        .unwrap();

    // The session is gone, the partition is released and no watches leak.
    assert!(store.list_sessions().await.unwrap().is_empty());
    let partition = store.list_partitions().await.unwrap().remove(0);
    assert_eq!(partition.session, None);
    assert_eq!(partition.state, PartitionState::Unassigned);
    assert_eq!(store.watch_count(), 0);
}
