//! In-memory broker testing utilities
//!
//! Provides a deterministic stand-in for a Kafka cluster:
//! - [`InMemoryBroker`]: partitioned topic logs and committed offsets per group
//! - [`InMemoryProducer`]: [`Producer`] appending to the broker
//! - [`InMemoryConsumerGroup`]: [`ConsumerGroup`] with forced rebalances and
//!   injectable failures

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::{DateTime, Utc};
use fluxgate_core::broker::{
    BrokerError, BrokerFuture, ConsumerGroup, GroupHandler, GroupSession, OffsetCommitter,
    PartitionClaim, Producer, TopicPartition,
};
use fluxgate_core::message::{ConsumedMessage, Delivery, OutboundMessage};
use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Messages buffered between a partition feeder and its claim loop.
const CLAIM_BUFFER: usize = 8;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct BrokerState {
    partitions: usize,
    logs: Mutex<HashMap<String, Vec<Vec<StoredRecord>>>>,
    committed: Mutex<HashMap<(String, TopicPartition), i64>>,
    round_robin: AtomicUsize,
    appended: watch::Sender<u64>,
}

/// In-memory Kafka cluster for fast, deterministic testing.
///
/// Every topic has the same number of partitions. Keyed messages are
/// partitioned by key hash; unkeyed messages round-robin.
///
/// # Example
///
/// ```
/// use fluxgate_testing::InMemoryBroker;
///
/// let broker = InMemoryBroker::with_partitions(3);
/// let first = broker.append("orders", Some("customer-1"), b"a".to_vec());
/// let second = broker.append("orders", Some("customer-1"), b"b".to_vec());
///
/// assert_eq!(first.partition, second.partition);
/// assert_eq!(second.offset, first.offset + 1);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create a broker with single-partition topics.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Create a broker whose topics have `partitions` partitions (at least one).
    #[must_use]
    pub fn with_partitions(partitions: usize) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            state: Arc::new(BrokerState {
                partitions: partitions.max(1),
                logs: Mutex::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                round_robin: AtomicUsize::new(0),
                appended,
            }),
        }
    }

    /// Number of partitions per topic.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.state.partitions
    }

    /// A producer connected to this broker.
    #[must_use]
    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer::new(self.clone())
    }

    /// A consumer-group member connected to this broker.
    #[must_use]
    pub fn consumer_group(&self, group_id: impl Into<String>) -> InMemoryConsumerGroup {
        InMemoryConsumerGroup::new(self.clone(), group_id.into())
    }

    /// Append a message to `topic`, creating the topic if needed.
    pub fn append(&self, topic: &str, key: Option<&str>, payload: impl Into<Vec<u8>>) -> Delivery {
        let partition = self.partition_for(key);
        let offset = {
            let mut logs = self.state.logs.lock().unwrap();
            let log = logs
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); self.state.partitions]);
            let records = &mut log[partition];
            records.push(StoredRecord {
                key: key.map(ToString::to_string),
                payload: payload.into(),
                timestamp: Utc::now(),
            });
            records.len() - 1
        };
        self.state.appended.send_modify(|count| *count += 1);

        Delivery {
            partition: i32::try_from(partition).unwrap(),
            offset: i64::try_from(offset).unwrap(),
        }
    }

    /// All messages of `topic`, partition by partition, in offset order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<ConsumedMessage> {
        (0..self.state.partitions)
            .flat_map(|partition| self.fetch(topic, i32::try_from(partition).unwrap(), 0))
            .collect()
    }

    /// Messages of `topic`/`partition` starting at offset `from`.
    #[must_use]
    pub fn fetch(&self, topic: &str, partition: i32, from: i64) -> Vec<ConsumedMessage> {
        let logs = self.state.logs.lock().unwrap();
        let Some(records) = logs
            .get(topic)
            .and_then(|log| log.get(usize::try_from(partition).ok()?))
        else {
            return Vec::new();
        };

        let start = usize::try_from(from.max(0)).unwrap();
        records
            .iter()
            .enumerate()
            .skip(start)
            .map(|(offset, record)| ConsumedMessage {
                topic: topic.to_string(),
                partition,
                offset: i64::try_from(offset).unwrap(),
                key: record.key.clone(),
                payload: record.payload.clone(),
                timestamp: Some(record.timestamp),
            })
            .collect()
    }

    /// Offset `group_id` will resume from on `topic`/`partition`.
    #[must_use]
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .committed
            .lock()
            .unwrap()
            .get(&(group_id.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    fn commit(&self, group_id: &str, topic: &str, partition: i32, next_offset: i64) {
        self.state.committed.lock().unwrap().insert(
            (group_id.to_string(), TopicPartition::new(topic, partition)),
            next_offset,
        );
    }

    fn partition_for(&self, key: Option<&str>) -> usize {
        let partitions = self.state.partitions;
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                usize::try_from(hasher.finish() % u64::try_from(partitions).unwrap()).unwrap()
            },
            None => self.state.round_robin.fetch_add(1, Ordering::SeqCst) % partitions,
        }
    }

    fn subscribe_appends(&self) -> watch::Receiver<u64> {
        self.state.appended.subscribe()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Producer`] appending to an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    closed: Arc<AtomicBool>,
    unreachable: Arc<AtomicBool>,
    failures: Arc<Mutex<VecDeque<BrokerError>>>,
}

impl InMemoryProducer {
    fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            closed: Arc::new(AtomicBool::new(false)),
            unreachable: Arc::new(AtomicBool::new(false)),
            failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Fail the next send with `error` instead of appending.
    pub fn fail_next_send(&self, error: BrokerError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Make [`Producer::check_connection`] fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Whether [`Producer::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Producer for InMemoryProducer {
    fn send(&self, message: OutboundMessage) -> BrokerFuture<'_, Delivery> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }
            let injected = self.failures.lock().unwrap().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }
            Ok(self
                .broker
                .append(&message.topic, message.key.as_deref(), message.payload))
        })
    }

    fn check_connection(&self, _timeout: Duration) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(BrokerError::ConnectionFailed(
                    "no brokers reachable".to_string(),
                ));
            }
            Ok(())
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Debug)]
struct GroupState {
    broker: InMemoryBroker,
    group_id: String,
    member_id: String,
    closed: watch::Sender<bool>,
    rebalance: watch::Sender<u64>,
    generation: AtomicU64,
    consume_calls: AtomicUsize,
    failures: Mutex<VecDeque<BrokerError>>,
}

/// [`ConsumerGroup`] member of an [`InMemoryBroker`].
///
/// The single member is assigned every partition of the requested topics.
/// Each generation resumes from the committed offsets and lasts until
/// [`InMemoryConsumerGroup::force_rebalance`] or [`ConsumerGroup::close`].
///
/// Clones share state, so a test can keep one handle while the gateway owns
/// another.
#[derive(Debug, Clone)]
pub struct InMemoryConsumerGroup {
    state: Arc<GroupState>,
}

impl InMemoryConsumerGroup {
    fn new(broker: InMemoryBroker, group_id: String) -> Self {
        let (closed, _) = watch::channel(false);
        let (rebalance, _) = watch::channel(0);
        Self {
            state: Arc::new(GroupState {
                broker,
                member_id: format!("{group_id}-member-1"),
                group_id,
                closed,
                rebalance,
                generation: AtomicU64::new(0),
                consume_calls: AtomicUsize::new(0),
                failures: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.state.group_id
    }

    /// End the current generation. The session is ended, in-flight handlers
    /// finish, uncommitted messages wait for the next generation and
    /// [`ConsumerGroup::consume`] returns `Ok(())`.
    pub fn force_rebalance(&self) {
        self.state.rebalance.send_modify(|count| *count += 1);
    }

    /// Fail the next [`ConsumerGroup::consume`] call with `error`.
    pub fn fail_next_consume(&self, error: BrokerError) {
        self.state.failures.lock().unwrap().push_back(error);
    }

    /// How many times [`ConsumerGroup::consume`] was entered.
    #[must_use]
    pub fn consume_calls(&self) -> usize {
        self.state.consume_calls.load(Ordering::SeqCst)
    }

    /// Number of generations started.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::SeqCst)
    }

    /// Whether [`ConsumerGroup::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.state.closed.borrow()
    }

    /// Offset this group resumes from on `topic`/`partition`.
    #[must_use]
    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .broker
            .committed_offset(&self.state.group_id, topic, partition)
    }
}

impl ConsumerGroup for InMemoryConsumerGroup {
    fn consume<'a>(
        &'a self,
        topics: &'a [String],
        handler: Arc<dyn GroupHandler>,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let state = &self.state;
            state.consume_calls.fetch_add(1, Ordering::SeqCst);

            let mut closed = state.closed.subscribe();
            if *closed.borrow_and_update() {
                return Err(BrokerError::Closed);
            }
            let injected = state.failures.lock().unwrap().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }

            let mut rebalance = state.rebalance.subscribe();
            let generation = state.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let partitions = i32::try_from(state.broker.partitions()).unwrap();
            let assignment: Vec<TopicPartition> = topics
                .iter()
                .flat_map(|topic| (0..partitions).map(move |p| TopicPartition::new(topic.clone(), p)))
                .collect();

            let committer = Arc::new(GroupCommitter {
                broker: state.broker.clone(),
                group_id: state.group_id.clone(),
            });
            let session = Arc::new(GroupSession::new(
                generation,
                state.member_id.clone(),
                assignment.clone(),
                committer,
            ));

            handler.setup(&session)?;

            let (stop, _) = watch::channel(false);
            let mut tasks = JoinSet::new();
            for partition in assignment {
                let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                tasks.spawn(feed_partition(
                    state.broker.clone(),
                    state.group_id.clone(),
                    partition.clone(),
                    tx,
                    stop.subscribe(),
                ));

                let handler = Arc::clone(&handler);
                let session = Arc::clone(&session);
                tasks.spawn(async move {
                    let claim = PartitionClaim::new(partition.topic, partition.partition, rx);
                    let _ = handler.consume_claim(&session, claim).await;
                });
            }

            let outcome = tokio::select! {
                () = wait_until_closed(&mut closed) => Err(BrokerError::Closed),
                _ = rebalance.changed() => Ok(()),
            };

            session.end();
            stop.send_replace(true);
            while tasks.join_next().await.is_some() {}

            handler.cleanup(&session)?;
            outcome
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.state.closed.send_replace(true);
            Ok(())
        })
    }
}

struct GroupCommitter {
    broker: InMemoryBroker,
    group_id: String,
}

impl OffsetCommitter for GroupCommitter {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        self.broker
            .commit(&self.group_id, topic, partition, next_offset);
        Ok(())
    }
}

/// Push `partition`'s messages into its claim until the generation stops.
async fn feed_partition(
    broker: InMemoryBroker,
    group_id: String,
    partition: TopicPartition,
    tx: mpsc::Sender<ConsumedMessage>,
    mut stop: watch::Receiver<bool>,
) {
    let mut next = broker
        .committed_offset(&group_id, &partition.topic, partition.partition)
        .unwrap_or(0);
    let mut appended = broker.subscribe_appends();

    loop {
        drop(appended.borrow_and_update());

        for message in broker.fetch(&partition.topic, partition.partition, next) {
            next = message.next_offset();
            tokio::select! {
                biased;
                _ = stop.changed() => return,
                sent = tx.send(message) => {
                    if sent.is_err() {
                        return;
                    }
                },
            }
        }

        tokio::select! {
            biased;
            _ = stop.changed() => return,
            _ = appended.changed() => {},
        }
    }
}

async fn wait_until_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_messages_share_a_partition() {
        let broker = InMemoryBroker::with_partitions(4);
        let deliveries: Vec<Delivery> = (0..5)
            .map(|i| broker.append("orders", Some("customer-7"), vec![i]))
            .collect();

        assert!(deliveries.iter().all(|d| d.partition == deliveries[0].partition));
        let offsets: Vec<i64> = deliveries.iter().map(|d| d.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unkeyed_messages_round_robin() {
        let broker = InMemoryBroker::with_partitions(3);
        let partitions: Vec<i32> = (0..3)
            .map(|_| broker.append("orders", None, b"x".to_vec()).partition)
            .collect();

        assert_eq!(partitions, vec![0, 1, 2]);
    }

    #[test]
    fn fetch_starts_at_offset() {
        let broker = InMemoryBroker::new();
        for i in 0..4u8 {
            broker.append("orders", None, vec![i]);
        }

        let fetched = broker.fetch("orders", 0, 2);
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].offset, 2);
        assert_eq!(fetched[0].payload, vec![2]);
        assert!(broker.fetch("missing", 0, 0).is_empty());
    }

    #[tokio::test]
    async fn producer_failures_and_close() {
        let broker = InMemoryBroker::new();
        let producer = broker.producer();

        producer.fail_next_send(BrokerError::Transport("reset".to_string()));
        assert!(producer.send(OutboundMessage::new("orders", b"a".to_vec())).await.is_err());
        assert!(producer.send(OutboundMessage::new("orders", b"b".to_vec())).await.is_ok());

        producer.close().await.unwrap();
        assert!(producer.is_closed());
        assert_eq!(
            producer.send(OutboundMessage::new("orders", b"c".to_vec())).await,
            Err(BrokerError::Closed)
        );
        assert_eq!(broker.messages("orders").len(), 1);
    }

    struct CommitAll;

    impl GroupHandler for CommitAll {
        fn setup(&self, _session: &GroupSession) -> Result<(), BrokerError> {
            Ok(())
        }

        fn cleanup(&self, _session: &GroupSession) -> Result<(), BrokerError> {
            Ok(())
        }

        fn consume_claim<'a>(
            &'a self,
            session: &'a GroupSession,
            mut claim: PartitionClaim,
        ) -> BrokerFuture<'a, ()> {
            Box::pin(async move {
                while let Some(message) = claim.next().await {
                    session.mark_message(&message)?;
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn generation_commits_and_ends_on_rebalance_then_close() {
        let broker = InMemoryBroker::new();
        broker.append("orders", None, b"a".to_vec());
        broker.append("orders", None, b"b".to_vec());

        let group = broker.consumer_group("billing");
        let topics = vec!["orders".to_string()];

        let consumer = group.clone();
        let run = tokio::spawn(async move {
            let handler: Arc<dyn GroupHandler> = Arc::new(CommitAll);
            consumer.consume(&topics, Arc::clone(&handler)).await
        });

        crate::eventually(Duration::from_secs(2), || group.committed_offset("orders", 0) == Some(2)).await;
        group.force_rebalance();
        assert_eq!(run.await.unwrap(), Ok(()));
        assert_eq!(group.generation(), 1);

        group.close().await.unwrap();
        let handler: Arc<dyn GroupHandler> = Arc::new(CommitAll);
        let topics = vec!["orders".to_string()];
        assert_eq!(group.consume(&topics, handler).await, Err(BrokerError::Closed));
    }

    #[tokio::test]
    async fn injected_consume_failure_is_returned_once() {
        let broker = InMemoryBroker::new();
        let group = broker.consumer_group("billing");
        group.fail_next_consume(BrokerError::ConsumerGroup("coordinator unavailable".to_string()));

        let handler: Arc<dyn GroupHandler> = Arc::new(CommitAll);
        let topics = vec!["orders".to_string()];
        assert!(matches!(
            group.consume(&topics, handler).await,
            Err(BrokerError::ConsumerGroup(_))
        ));
        assert_eq!(group.generation(), 0);
        assert_eq!(group.consume_calls(), 1);
    }
}
