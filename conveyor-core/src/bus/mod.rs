//! In-process event bus with a durable tail.
//!
//! `publish` assigns the global sequence number, stores the event in a
//! bounded ring buffer, fans it out to every live subscriber, and hands it to
//! a background writer task for the durable log. Assignment, ring update, and
//! subscriber delivery happen under one lock so a subscriber that takes
//! "snapshot + live stream" never observes a gap or a duplicate.
//!
//! The durable path is deliberately decoupled: a full writer queue or a
//! failing store costs durability for those events, never publication.

pub mod store;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};

use crate::config::BusConfig;
use crate::error::Result;
use crate::events::{Event, EventDraft, EventPublisher};
use crate::ids::SubscriberId;

pub use store::{EventStore, JsonlEventStore, NullEventStore};

/// Snapshot-plus-live-feed handed to a new subscriber.
///
/// The snapshot is the bounded recent tail of the log (most recent
/// `snapshot_limit` events, oldest first); `events` then delivers everything
/// published after the subscription was registered, in sequence order.
pub struct EventSubscription {
    /// Identifier to pass to [`EventBus::unsubscribe`].
    pub id: SubscriberId,
    /// Bounded replay of the most recent events.
    pub snapshot: Vec<Event>,
    /// Live feed. Closed when the subscriber is disconnected for falling
    /// behind or the bus shuts down.
    pub events: mpsc::Receiver<Event>,
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .field("snapshot_len", &self.snapshot.len())
            .finish()
    }
}

struct BusState {
    next_sequence: u64,
    ring: VecDeque<Event>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Event>>,
}

/// Append-only structured event sink with live fan-out.
pub struct EventBus {
    config: BusConfig,
    state: Mutex<BusState>,
    store: Arc<dyn EventStore>,
    writer_tx: mpsc::Sender<Event>,
    pending_writes: Arc<AtomicUsize>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("EventBus");
        debug.field("config", &self.config);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("next_sequence", &state.next_sequence)
                    .field("ring_len", &state.ring.len())
                    .field("subscriber_count", &state.subscribers.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl EventBus {
    /// Build a bus over `store`, resuming the sequence counter from the
    /// store's newest record so sequences stay monotonic across restarts.
    pub async fn new(store: Arc<dyn EventStore>, config: BusConfig) -> Self {
        let next_sequence = match store.read_last(1).await {
            Ok(tail) => tail.last().map(|event| event.sequence + 1).unwrap_or(1),
            Err(err) => {
                tracing::warn!(
                    target: "conveyor::bus",
                    error = %err,
                    "could not read event log tail, starting sequence at 1"
                );
                1
            }
        };

        let (writer_tx, writer_rx) = mpsc::channel(config.writer_queue_capacity.max(1));
        let pending_writes = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_writer(
            Arc::clone(&store),
            writer_rx,
            Arc::clone(&pending_writes),
        ));

        Self {
            config,
            state: Mutex::new(BusState {
                next_sequence,
                ring: VecDeque::with_capacity(config.ring_capacity.min(1_024)),
                subscribers: HashMap::new(),
            }),
            store,
            writer_tx,
            pending_writes,
        }
    }

    /// Register a new observer. The returned snapshot and live feed together
    /// cover every event from the snapshot's first sequence onward, without
    /// gaps or duplicates.
    pub async fn subscribe(&self) -> EventSubscription {
        let mut state = self.state.lock().await;
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity.max(1));

        let skip = state
            .ring
            .len()
            .saturating_sub(self.config.snapshot_limit);
        let snapshot: Vec<Event> = state.ring.iter().skip(skip).cloned().collect();

        state.subscribers.insert(id, tx);
        tracing::debug!(target: "conveyor::bus", subscriber = %id, snapshot = snapshot.len(), "subscriber attached");

        EventSubscription {
            id,
            snapshot,
            events: rx,
        }
    }

    /// Detach an observer. Dropping the subscription has the same effect on
    /// the next publish; this just frees the slot eagerly.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let mut state = self.state.lock().await;
        if state.subscribers.remove(&id).is_some() {
            tracing::debug!(target: "conveyor::bus", subscriber = %id, "subscriber detached");
        }
    }

    /// Read everything after `sequence` from the durable log, for observers
    /// reconnecting with a position older than the in-memory snapshot covers.
    pub async fn replay_since(&self, sequence: u64) -> Result<Vec<Event>> {
        self.store.read_since(sequence).await
    }

    /// Number of currently attached subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    /// Wait until every event handed to the writer so far has been offered to
    /// the store. Used at shutdown so the final audit record lands on disk.
    pub async fn flush(&self) {
        while self.pending_writes.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    async fn publish_inner(&self, draft: EventDraft) -> Event {
        let mut state = self.state.lock().await;

        let event = Event {
            sequence: state.next_sequence,
            run_id: draft.run_id,
            source: draft.source,
            kind: draft.kind,
            timestamp: Utc::now(),
            message: draft.message,
            data: draft.data,
        };
        state.next_sequence += 1;

        state.ring.push_back(event.clone());
        while state.ring.len() > self.config.ring_capacity.max(1) {
            state.ring.pop_front();
        }

        // A slow or dead subscriber only loses its own feed.
        let mut dropped = Vec::new();
        for (id, tx) in state.subscribers.iter() {
            if tx.try_send(event.clone()).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            state.subscribers.remove(&id);
            tracing::warn!(
                target: "conveyor::bus",
                subscriber = %id,
                sequence = event.sequence,
                "disconnecting subscriber with saturated or closed queue"
            );
        }

        // Durable hand-off stays inside the lock so the writer sees events in
        // sequence order.
        self.pending_writes.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.writer_tx.try_send(event.clone()) {
            self.pending_writes.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(
                target: "conveyor::bus",
                sequence = event.sequence,
                error = %err,
                "event log writer queue full, dropping durable copy"
            );
        }

        event
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, draft: EventDraft) -> Result<Event> {
        Ok(self.publish_inner(draft).await)
    }
}

async fn run_writer(
    store: Arc<dyn EventStore>,
    mut rx: mpsc::Receiver<Event>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = store.append(&event).await {
            tracing::warn!(
                target: "conveyor::bus",
                sequence = event.sequence,
                error = %err,
                "durable event append failed, continuing without it"
            );
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, EventSource};
    use crate::ids::RunId;
    use std::time::Duration;

    fn draft(run_id: RunId, n: u64) -> EventDraft {
        EventDraft::new(run_id, EventSource::Pipeline, EventKind::Log)
            .with_message(format!("event {n}"))
    }

    fn small_config() -> BusConfig {
        BusConfig {
            ring_capacity: 16,
            subscriber_queue_capacity: 8,
            snapshot_limit: 16,
            writer_queue_capacity: 64,
        }
    }

    /// Store whose appends always fail, to prove durability failures stay out
    /// of the publish path.
    #[derive(Debug, Default)]
    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn append(&self, _event: &Event) -> Result<()> {
            Err(crate::error::ConveyorError::Io(std::io::Error::other(
                "disk full",
            )))
        }

        async fn read_last(&self, _limit: usize) -> Result<Vec<Event>> {
            Ok(Vec::new())
        }

        async fn read_since(&self, _since: u64) -> Result<Vec<Event>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn snapshot_plus_live_feed_has_no_gaps_or_duplicates() {
        let bus = EventBus::new(Arc::new(NullEventStore), small_config()).await;
        let run_id = RunId::new();

        for n in 0..5 {
            bus.publish(draft(run_id, n)).await.expect("publish");
        }

        let mut subscription = bus.subscribe().await;
        assert_eq!(subscription.snapshot.len(), 5);

        for n in 5..8 {
            bus.publish(draft(run_id, n)).await.expect("publish");
        }

        let mut seen: Vec<u64> = subscription
            .snapshot
            .iter()
            .map(|event| event.sequence)
            .collect();
        for _ in 0..3 {
            let event = subscription.events.recv().await.expect("live event");
            seen.push(event.sequence);
        }

        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_without_affecting_others() {
        let mut config = small_config();
        config.subscriber_queue_capacity = 2;
        let bus = EventBus::new(Arc::new(NullEventStore), config).await;
        let run_id = RunId::new();

        // Slow subscriber never drains its queue; the healthy one drains
        // continuously from a background task.
        let slow = bus.subscribe().await;
        let mut healthy = bus.subscribe().await;
        assert_eq!(bus.subscriber_count().await, 2);

        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 6 {
                match healthy.events.recv().await {
                    Some(event) => seen.push(event.sequence),
                    None => break,
                }
            }
            seen
        });

        for n in 0..6 {
            bus.publish(draft(run_id, n)).await.expect("publish");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Slow queue (capacity 2) overflowed on the third publish, leaving
        // only the healthy subscriber attached.
        assert_eq!(bus.subscriber_count().await, 1);

        let healthy_seen = tokio::time::timeout(Duration::from_secs(1), collector)
            .await
            .expect("collector finished in time")
            .expect("collector task");
        assert_eq!(healthy_seen, vec![1, 2, 3, 4, 5, 6]);

        drop(slow);
    }

    #[tokio::test]
    async fn store_failures_never_reach_publishers_or_subscribers() {
        let bus = EventBus::new(Arc::new(FailingStore), small_config()).await;
        let run_id = RunId::new();
        let mut subscription = bus.subscribe().await;

        for n in 0..4 {
            bus.publish(draft(run_id, n)).await.expect("publish must not fail");
        }
        bus.flush().await;

        for expected in 1..=4 {
            let event = subscription.events.recv().await.expect("live event");
            assert_eq!(event.sequence, expected);
        }
    }

    #[tokio::test]
    async fn sequence_resumes_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let run_id = RunId::new();

        {
            let store = Arc::new(JsonlEventStore::new(&path));
            let bus = EventBus::new(store, small_config()).await;
            for n in 0..3 {
                bus.publish(draft(run_id, n)).await.expect("publish");
            }
            bus.flush().await;
        }

        let store = Arc::new(JsonlEventStore::new(&path));
        let bus = EventBus::new(store, small_config()).await;
        let event = bus.publish(draft(run_id, 99)).await.expect("publish");
        assert_eq!(event.sequence, 4);

        bus.flush().await;
        let replay = bus.replay_since(2).await.expect("replay");
        assert_eq!(
            replay.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn unsubscribe_frees_the_slot() {
        let bus = EventBus::new(Arc::new(NullEventStore), small_config()).await;
        let subscription = bus.subscribe().await;
        assert_eq!(bus.subscriber_count().await, 1);
        bus.unsubscribe(subscription.id).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
