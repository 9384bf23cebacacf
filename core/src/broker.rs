//! Broker seam: the connections the gateway drives.
//!
//! The gateway never talks to a concrete client. It owns a [`Producer`] and,
//! when consuming, a [`ConsumerGroup`]; both are implemented over rdkafka in
//! `fluxgate-kafka` and in memory in `fluxgate-testing`.
//!
//! # Consumer-group protocol
//!
//! [`ConsumerGroup::consume`] runs one *generation*: the broker client assigns
//! partitions, calls [`GroupHandler::setup`], runs
//! [`GroupHandler::consume_claim`] concurrently once per assigned partition,
//! and when the generation ends (rebalance, error or close) waits for every
//! claim loop to return before calling [`GroupHandler::cleanup`].
//!
//! ```text
//! consume(topics, handler)
//!   ├─ setup(session)
//!   ├─ consume_claim(session, claim p0) ─┐
//!   ├─ consume_claim(session, claim p1) ─┤  concurrent, each sequential
//!   ├─ consume_claim(session, claim pN) ─┘
//!   └─ cleanup(session)
//! ```
//!
//! When the generation ends the session is marked ended first: claim loops
//! stop dispatching and [`GroupSession::mark_message`] refuses to commit, so
//! nothing is committed for partitions that may already belong to another
//! member. The claim's message channel then closes and the loop returns.

use crate::message::{ConsumedMessage, Delivery, OutboundMessage};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by broker connections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection was explicitly closed; expected during shutdown
    #[error("Connection closed")]
    Closed,

    /// Could not open or reach the connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A produce request failed
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Offset commit failed
    #[error("Commit failed for {topic}/{partition}@{offset}: {reason}")]
    CommitFailed {
        /// Topic of the committed message
        topic: String,
        /// Partition of the committed message
        partition: i32,
        /// Offset that was being committed
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Consumer group protocol error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether this error means the connection was closed on purpose.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// A connection able to publish messages.
pub trait Producer: Send + Sync {
    /// Publish `message` and wait for the broker acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker rejects or times
    /// out the send and [`BrokerError::Closed`] after [`Producer::close`].
    fn send(&self, message: OutboundMessage) -> BrokerFuture<'_, Delivery>;

    /// Verify the cluster is reachable, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if cluster metadata cannot
    /// be fetched in time.
    fn check_connection(&self, timeout: Duration) -> BrokerFuture<'_, ()>;

    /// Flush and close the connection. It cannot be reopened.
    ///
    /// # Errors
    ///
    /// Returns an error if pending messages could not be flushed.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// A consumer-group membership.
pub trait ConsumerGroup: Send + Sync {
    /// Join the group for `topics` and run one generation with `handler`.
    ///
    /// Returns `Ok(())` when the generation ends because of a rebalance; the
    /// caller re-enters to join the next generation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] once [`ConsumerGroup::close`] has been
    /// called, or any other error the client reports.
    fn consume<'a>(
        &'a self,
        topics: &'a [String],
        handler: Arc<dyn GroupHandler>,
    ) -> BrokerFuture<'a, ()>;

    /// Leave the group. Any in-flight [`ConsumerGroup::consume`] returns
    /// [`BrokerError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the client fails to leave cleanly.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Callbacks driven by [`ConsumerGroup::consume`].
pub trait GroupHandler: Send + Sync {
    /// Called at the start of a generation, before any claim is consumed.
    ///
    /// # Errors
    ///
    /// An error aborts the generation.
    fn setup(&self, session: &GroupSession) -> Result<(), BrokerError>;

    /// Called once all claim loops of the generation have returned.
    ///
    /// # Errors
    ///
    /// The error is reported by [`ConsumerGroup::consume`].
    fn cleanup(&self, session: &GroupSession) -> Result<(), BrokerError>;

    /// Consume one partition until its claim is closed.
    ///
    /// # Errors
    ///
    /// An error ends this claim loop only.
    fn consume_claim<'a>(
        &'a self,
        session: &'a GroupSession,
        claim: PartitionClaim,
    ) -> BrokerFuture<'a, ()>;
}

/// Commits processed offsets on behalf of a session.
pub trait OffsetCommitter: Send + Sync {
    /// Record that everything before `next_offset` in `topic`/`partition`
    /// has been processed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the commit is rejected.
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError>;
}

/// A topic/partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a topic/partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// One generation of group membership.
pub struct GroupSession {
    generation: u64,
    member_id: String,
    assignment: Vec<TopicPartition>,
    committer: Arc<dyn OffsetCommitter>,
    ended: AtomicBool,
}

impl GroupSession {
    /// Create a session.
    #[must_use]
    pub fn new(
        generation: u64,
        member_id: impl Into<String>,
        assignment: Vec<TopicPartition>,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Self {
        Self {
            generation,
            member_id: member_id.into(),
            assignment,
            committer,
            ended: AtomicBool::new(false),
        }
    }

    /// Generation counter, increasing with every rebalance.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Member id the broker assigned to this process.
    #[must_use]
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Partitions assigned for this generation.
    #[must_use]
    pub fn assignment(&self) -> &[TopicPartition] {
        &self.assignment
    }

    /// Mark `message` as processed, committing its offset.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] once the session has ended, or
    /// the committer's error.
    pub fn mark_message(&self, message: &ConsumedMessage) -> Result<(), BrokerError> {
        if self.is_ended() {
            return Err(BrokerError::CommitFailed {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                reason: format!("generation {} has ended", self.generation),
            });
        }
        self.committer
            .commit(&message.topic, message.partition, message.next_offset())
    }

    /// End the generation. Called by the broker client when partitions are
    /// revoked or the group is closed.
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    /// Whether [`GroupSession::end`] was called.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for GroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSession")
            .field("generation", &self.generation)
            .field("member_id", &self.member_id)
            .field("assignment", &self.assignment)
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

/// The messages of one assigned partition for the current generation.
#[derive(Debug)]
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<ConsumedMessage>,
}

impl PartitionClaim {
    /// Create a claim fed by `messages`.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, messages: mpsc::Receiver<ConsumedMessage>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    /// Claimed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Claimed partition.
    #[must_use]
    pub const fn partition(&self) -> i32 {
        self.partition
    }

    /// Next message in offset order, or `None` once the generation ended.
    pub async fn next(&mut self) -> Option<ConsumedMessage> {
        self.messages.recv().await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, i32, i64)>>);

    impl OffsetCommitter for Recorder {
        fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
            self.0
                .lock()
                .unwrap()
                .push((topic.to_string(), partition, next_offset));
            Ok(())
        }
    }

    fn message(offset: i64) -> ConsumedMessage {
        ConsumedMessage {
            topic: "orders".to_string(),
            partition: 2,
            offset,
            key: None,
            payload: Vec::new(),
            timestamp: None,
        }
    }

    #[test]
    fn mark_message_commits_next_offset() {
        let recorder = Arc::new(Recorder::default());
        let session = GroupSession::new(
            1,
            "member-1",
            vec![TopicPartition::new("orders", 2)],
            Arc::clone(&recorder) as Arc<dyn OffsetCommitter>,
        );

        session.mark_message(&message(41)).unwrap();

        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            [("orders".to_string(), 2, 42)]
        );
    }

    #[test]
    fn ended_session_refuses_commits() {
        let recorder = Arc::new(Recorder::default());
        let session = GroupSession::new(
            3,
            "member-1",
            vec![TopicPartition::new("orders", 2)],
            Arc::clone(&recorder) as Arc<dyn OffsetCommitter>,
        );

        session.end();

        assert!(session.is_ended());
        assert!(matches!(
            session.mark_message(&message(7)),
            Err(BrokerError::CommitFailed { offset: 7, .. })
        ));
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_yields_in_order_then_ends() {
        let (tx, rx) = mpsc::channel(4);
        let mut claim = PartitionClaim::new("orders", 0, rx);
        tx.send(message(0)).await.unwrap();
        tx.send(message(1)).await.unwrap();
        drop(tx);

        assert_eq!(claim.next().await.unwrap().offset, 0);
        assert_eq!(claim.next().await.unwrap().offset, 1);
        assert!(claim.next().await.is_none());
    }

    #[test]
    fn closed_is_distinguishable() {
        assert!(BrokerError::Closed.is_closed());
        assert!(!BrokerError::Transport("reset".to_string()).is_closed());
    }
}
