//! Consumer-group connection over rdkafka's [`StreamConsumer`].
//!
//! One [`ConsumerGroup::consume`] call is one generation. Generations follow
//! the group's rebalances through [`GroupContext`]: the call waits for an
//! assignment, splits one queue per assigned partition and hands them to
//! [`run_generation`]. A revoke ends the session from inside the rebalance
//! callback, before librdkafka gives the partitions up, so nothing is
//! dispatched or committed for them afterwards.
//!
//! A generation also ends when the main stream reports an error, or on
//! [`ConsumerGroup::close`].

use crate::client_config::consumer_config;
use crate::fanout::{PartitionSource, run_generation};
use chrono::{DateTime, Utc};
use fluxgate_core::broker::{
    BrokerError, BrokerFuture, ConsumerGroup, GroupHandler, GroupSession, OffsetCommitter,
    TopicPartition,
};
use fluxgate_core::config::BrokerConfig;
use fluxgate_core::message::ConsumedMessage;
use futures::StreamExt;
use rdkafka::client::ClientContext;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;

type GroupConsumer = StreamConsumer<GroupContext>;

/// Assignment as seen by the rebalance callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RebalanceState {
    /// Bumped on every revoke, assign or rebalance error
    epoch: u64,
    /// Partitions owned since the last assign; `None` while revoked
    assignment: Option<Vec<TopicPartition>>,
}

/// Rebalance callbacks marking generation boundaries.
struct GroupContext {
    rebalances: Arc<watch::Sender<RebalanceState>>,
    active: Arc<Mutex<Weak<GroupSession>>>,
}

impl GroupContext {
    fn end_generation(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = active.upgrade() {
            session.end();
        }
    }

    fn revoke(&self) {
        self.end_generation();
        self.rebalances.send_modify(|state| {
            state.epoch += 1;
            state.assignment = None;
        });
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(list) => {
                tracing::info!(partitions = list.count(), "Partitions revoked");
                self.revoke();
            },
            Rebalance::Assign(_) => {},
            Rebalance::Error(e) => {
                tracing::warn!(error = ?e, "Rebalance failed");
                self.revoke();
            },
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(list) = rebalance {
            let mut assignment: Vec<TopicPartition> = list
                .elements()
                .iter()
                .map(|element| TopicPartition::new(element.topic(), element.partition()))
                .collect();
            assignment.sort();
            tracing::info!(partitions = assignment.len(), "Partitions assigned");

            self.rebalances.send_modify(|state| {
                state.epoch += 1;
                state.assignment = Some(assignment);
            });
        }
    }
}

/// Kafka consumer-group membership.
pub struct KafkaConsumerGroup {
    consumer: Mutex<Option<Arc<GroupConsumer>>>,
    group_id: String,
    member_id: String,
    auto_commit: bool,
    generation: AtomicU64,
    subscription: Mutex<Vec<String>>,
    rebalances: Arc<watch::Sender<RebalanceState>>,
    active: Arc<Mutex<Weak<GroupSession>>>,
    closed: watch::Sender<bool>,
}

impl KafkaConsumerGroup {
    /// Open a consumer-group connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if `config` has no consumer
    /// group settings or librdkafka rejects them.
    pub fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let consumer_settings = config.consumer.as_ref().ok_or_else(|| {
            BrokerError::ConnectionFailed("consumer group id is required".to_string())
        })?;

        let rebalances = Arc::new(watch::Sender::new(RebalanceState::default()));
        let active = Arc::new(Mutex::new(Weak::new()));
        let context = GroupContext {
            rebalances: Arc::clone(&rebalances),
            active: Arc::clone(&active),
        };

        let consumer: GroupConsumer = consumer_config(config, consumer_settings)
            .create_with_context(context)
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create consumer: {e}")))?;

        tracing::info!(
            brokers = %config.bootstrap_servers(),
            group_id = %consumer_settings.group_id,
            auto_commit = consumer_settings.auto_commit,
            auto_offset_reset = consumer_settings.auto_offset_reset.as_kafka_value(),
            "Consumer group connection opened"
        );

        let (closed, _) = watch::channel(false);
        Ok(Self {
            consumer: Mutex::new(Some(Arc::new(consumer))),
            group_id: consumer_settings.group_id.clone(),
            member_id: config
                .client_id
                .clone()
                .unwrap_or_else(|| consumer_settings.group_id.clone()),
            auto_commit: consumer_settings.auto_commit,
            generation: AtomicU64::new(0),
            subscription: Mutex::new(Vec::new()),
            rebalances,
            active,
            closed,
        })
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn client(&self) -> Result<Arc<GroupConsumer>, BrokerError> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::Closed)
    }

    fn ensure_subscribed(&self, consumer: &GroupConsumer, topics: &[String]) -> Result<(), BrokerError> {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.as_slice() == topics {
            return Ok(());
        }

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs).map_err(|e| {
            BrokerError::ConsumerGroup(format!("Failed to subscribe to topics: {e}"))
        })?;
        tracing::info!(topics = ?topics, group_id = %self.group_id, "Subscribed to topics");

        *subscription = topics.to_vec();
        Ok(())
    }
}

impl ConsumerGroup for KafkaConsumerGroup {
    fn consume<'a>(
        &'a self,
        topics: &'a [String],
        handler: Arc<dyn GroupHandler>,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut closed = self.closed.subscribe();
            if *closed.borrow_and_update() {
                return Err(BrokerError::Closed);
            }
            let consumer = self.client()?;
            self.ensure_subscribed(&consumer, topics)?;

            let mut rebalances = self.rebalances.subscribe();
            let mut main = consumer.stream().map(|next| {
                next.map(|message| to_consumed(&message))
                    .map_err(|e| BrokerError::Transport(format!("Failed to receive message: {e}")))
            });

            // Polling the main stream is what runs the rebalance callbacks.
            let mut early = Vec::new();
            let (epoch, assignment) = loop {
                let assigned = {
                    let state = rebalances.borrow_and_update();
                    state.assignment.clone().map(|assignment| (state.epoch, assignment))
                };
                if let Some(assigned) = assigned {
                    break assigned;
                }

                tokio::select! {
                    biased;
                    () = wait_until_closed(&mut closed) => return Err(BrokerError::Closed),
                    changed = rebalances.changed() => {
                        if changed.is_err() {
                            return Err(BrokerError::Closed);
                        }
                    },
                    next = main.next() => match next {
                        Some(Ok(message)) => early.push(message),
                        Some(Err(e)) => return Err(e),
                        None => return Err(BrokerError::Closed),
                    },
                }
            };

            let mut partitions: Vec<(TopicPartition, PartitionSource)> = Vec::with_capacity(assignment.len());
            for partition in &assignment {
                let queue = consumer
                    .split_partition_queue(&partition.topic, partition.partition)
                    .ok_or_else(|| {
                        BrokerError::ConsumerGroup(format!("Failed to split queue for {partition}"))
                    })?;
                partitions.push((partition.clone(), partition_source(queue)));
            }

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let session = Arc::new(GroupSession::new(
                generation,
                self.member_id.clone(),
                assignment,
                Arc::new(KafkaCommitter {
                    consumer: Arc::clone(&consumer),
                    auto_commit: self.auto_commit,
                }),
            ));
            *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&session);

            let boundary = async {
                tokio::select! {
                    () = wait_until_closed(&mut closed) => Err(BrokerError::Closed),
                    () = wait_for_rebalance(&mut rebalances, epoch) => {
                        tracing::info!(generation, "Group rebalanced, ending generation");
                        Ok(())
                    },
                }
            };

            run_generation(session, handler, partitions, early, main, boundary).await
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.send_replace(true) {
                return Ok(());
            }
            let consumer = self
                .consumer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            if let Some(consumer) = consumer {
                consumer.unsubscribe();
                // Dropping the last handle leaves the group and closes the
                // sockets, which blocks.
                tokio::task::spawn_blocking(move || drop(consumer))
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?;
            }
            tracing::debug!(group_id = %self.group_id, "Consumer group left");
            Ok(())
        })
    }
}

/// Commits offsets through the group's consumer.
struct KafkaCommitter {
    consumer: Arc<GroupConsumer>,
    auto_commit: bool,
}

impl OffsetCommitter for KafkaCommitter {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        // librdkafka commits consumed positions itself in this mode.
        if self.auto_commit {
            return Ok(());
        }

        let commit_failed = |reason: String| BrokerError::CommitFailed {
            topic: topic.to_string(),
            partition,
            offset: next_offset - 1,
            reason,
        };

        let mut list = TopicPartitionList::new();
        list.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| commit_failed(e.to_string()))?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| commit_failed(e.to_string()))
    }
}

fn partition_source(queue: StreamPartitionQueue<GroupContext>) -> PartitionSource {
    futures::stream::unfold(queue, |queue| async move {
        let next = queue
            .recv()
            .await
            .map(|message| to_consumed(&message))
            .map_err(|e| BrokerError::Transport(format!("Failed to receive message: {e}")));
        Some((next, queue))
    })
    .boxed()
}

fn to_consumed(message: &BorrowedMessage<'_>) -> ConsumedMessage {
    ConsumedMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

async fn wait_until_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_rebalance(rebalances: &mut watch::Receiver<RebalanceState>, epoch: u64) {
    while rebalances.borrow_and_update().epoch == epoch {
        if rebalances.changed().await.is_err() {
            return;
        }
    }
}
