//! Consumer-group session adapter.
//!
//! [`SessionAdapter`] is the [`GroupHandler`] the gateway hands to its
//! consumer group. Each claim loop pulls messages in offset order and runs the
//! topic's handler inline; a message is committed only when the handler
//! returns `Ok(())`. Once the session has ended the loop stops dispatching.
//!
//! Every message gets a `pool {topic}` span. Messages with a handler also get
//! a `process {topic}` span linked to it, which carries the handler outcome.
//!
//! # Outcomes per message
//!
//! | handler | commit | `process` span |
//! |---|---|---|
//! | none registered | no | none |
//! | `Ok(())` | yes | ended |
//! | `Err(_)` or panic | no | error recorded |

use crate::metrics::GatewayMetrics;
use fluxgate_core::broker::{BrokerError, BrokerFuture, GroupHandler, GroupSession, PartitionClaim};
use fluxgate_core::handler::MessageContext;
use fluxgate_core::message::ConsumedMessage;
use fluxgate_core::registry::TopicRegistry;
use fluxgate_core::telemetry::{Attribute, SpanKind, Tracer, attributes};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// What happened to one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No handler for the topic; not committed
    Skipped,
    /// Handler succeeded and the offset was committed
    Committed,
    /// Handler succeeded but the commit was rejected
    CommitFailed,
    /// Handler returned an error or panicked; not committed
    Failed,
}

impl DispatchOutcome {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Committed => "committed",
            Self::CommitFailed => "commit_failed",
            Self::Failed => "failed",
        }
    }
}

/// Routes consumed messages to registered handlers.
pub struct SessionAdapter {
    registry: Arc<TopicRegistry>,
    tracer: Arc<dyn Tracer>,
}

impl SessionAdapter {
    /// Create an adapter over a frozen registry.
    #[must_use]
    pub fn new(registry: Arc<TopicRegistry>, tracer: Arc<dyn Tracer>) -> Self {
        Self { registry, tracer }
    }

    /// Run the handler for `message` and commit it on success.
    pub async fn dispatch(&self, session: &GroupSession, mut message: ConsumedMessage) -> DispatchOutcome {
        let pool = self.tracer.start_span(
            &format!("pool {}", message.topic),
            SpanKind::Consumer,
            consume_attributes(&message, attributes::OPERATION_RECEIVE),
        );

        let Some(handler) = self.registry.get(&message.topic) else {
            tracing::trace!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "No handler registered, skipping message"
            );
            GatewayMetrics::record_consume(&message.topic, DispatchOutcome::Skipped.as_str());
            return DispatchOutcome::Skipped;
        };

        let mut span = self.tracer.start_linked_span(
            &format!("process {}", message.topic),
            SpanKind::Consumer,
            consume_attributes(&message, attributes::OPERATION_PROCESS),
            pool.link().into_iter().collect(),
        );

        let ctx = MessageContext::from(&message);
        let payload = std::mem::take(&mut message.payload);

        // Covers panics raised while the handler builds its future.
        let outcome = match AssertUnwindSafe(async { handler.handle(ctx, payload).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => match session.mark_message(&message) {
                Ok(()) => DispatchOutcome::Committed,
                Err(e) => {
                    tracing::warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Failed to commit offset (message may be redelivered)"
                    );
                    span.set_error(&e);
                    DispatchOutcome::CommitFailed
                },
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %format!("{e:#}"),
                    "Handler failed, offset not committed"
                );
                span.set_error(&format!("{e:#}"));
                DispatchOutcome::Failed
            },
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    panic = %reason,
                    "Handler panicked, offset not committed"
                );
                span.set_error(&format!("handler panicked: {reason}"));
                DispatchOutcome::Failed
            },
        };

        GatewayMetrics::record_consume(&message.topic, outcome.as_str());
        outcome
    }
}

impl GroupHandler for SessionAdapter {
    fn setup(&self, session: &GroupSession) -> Result<(), BrokerError> {
        GatewayMetrics::record_rebalance();
        tracing::info!(
            generation = session.generation(),
            member_id = session.member_id(),
            partitions = session.assignment().len(),
            "Consumer group session started"
        );
        Ok(())
    }

    fn cleanup(&self, session: &GroupSession) -> Result<(), BrokerError> {
        tracing::info!(
            generation = session.generation(),
            "Consumer group session ending, partitions will be rebalanced"
        );
        Ok(())
    }

    fn consume_claim<'a>(
        &'a self,
        session: &'a GroupSession,
        mut claim: PartitionClaim,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(
                topic = claim.topic(),
                partition = claim.partition(),
                generation = session.generation(),
                "Claim started"
            );

            while let Some(message) = claim.next().await {
                if session.is_ended() {
                    tracing::debug!(
                        topic = claim.topic(),
                        partition = claim.partition(),
                        offset = message.offset,
                        "Session ended, leaving remaining messages for the next owner"
                    );
                    break;
                }
                self.dispatch(session, message).await;
            }

            tracing::debug!(
                topic = claim.topic(),
                partition = claim.partition(),
                "Claim ended"
            );
            Ok(())
        })
    }
}

fn consume_attributes(message: &ConsumedMessage, operation: &'static str) -> Vec<Attribute> {
    let mut attrs = vec![
        Attribute::string(attributes::MESSAGING_SYSTEM, attributes::SYSTEM_KAFKA),
        Attribute::string(attributes::MESSAGING_DESTINATION_NAME, message.topic.clone()),
        Attribute::string(attributes::MESSAGING_OPERATION_NAME, operation),
        Attribute::string(attributes::MESSAGING_OPERATION_TYPE, operation),
        Attribute::string(
            attributes::MESSAGING_DESTINATION_PARTITION_ID,
            message.partition.to_string(),
        ),
        Attribute::i64(attributes::MESSAGING_KAFKA_OFFSET, message.offset),
    ];
    if let Some(key) = &message.key {
        attrs.push(Attribute::string(attributes::MESSAGING_KAFKA_MESSAGE_KEY, key.clone()));
    }
    attrs
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use fluxgate_core::broker::{OffsetCommitter, TopicPartition};
    use fluxgate_core::handler::Handler;
    use fluxgate_core::telemetry::NoopTracer;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Commits(Mutex<Vec<i64>>);

    impl OffsetCommitter for Commits {
        fn commit(&self, _topic: &str, _partition: i32, next_offset: i64) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push(next_offset);
            Ok(())
        }
    }

    fn message(topic: &str, offset: i64, payload: &[u8]) -> ConsumedMessage {
        ConsumedMessage {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: Some("k".to_string()),
            payload: payload.to_vec(),
            timestamp: None,
        }
    }

    fn adapter() -> SessionAdapter {
        let mut registry = TopicRegistry::default();
        let ok: Arc<dyn Handler> = Arc::new(|_ctx: MessageContext, payload: Vec<u8>| async move {
            anyhow::ensure!(payload != b"bad", "rejected payload");
            Ok::<(), anyhow::Error>(())
        });
        let panicking: Arc<dyn Handler> = Arc::new(|_ctx: MessageContext, payload: Vec<u8>| async move {
            if !payload.is_empty() {
                panic!("poisoned message");
            }
            Ok::<(), anyhow::Error>(())
        });
        let eager: Arc<dyn Handler> = Arc::new(|_ctx: MessageContext, payload: Vec<u8>| {
            assert!(payload != b"poison", "rejected before any await");
            async { Ok::<(), anyhow::Error>(()) }
        });
        registry.register("orders", ok).unwrap();
        registry.register("poison", panicking).unwrap();
        registry.register("eager", eager).unwrap();
        SessionAdapter::new(Arc::new(registry), Arc::new(NoopTracer))
    }

    fn session(commits: &Arc<Commits>) -> GroupSession {
        GroupSession::new(
            1,
            "member",
            vec![TopicPartition::new("orders", 0)],
            Arc::clone(commits) as Arc<dyn OffsetCommitter>,
        )
    }

    #[tokio::test]
    async fn success_commits_next_offset() {
        let commits = Arc::new(Commits::default());
        let outcome = adapter()
            .dispatch(&session(&commits), message("orders", 4, b"ok"))
            .await;

        assert_eq!(outcome, DispatchOutcome::Committed);
        assert_eq!(commits.0.lock().unwrap().as_slice(), [5]);
    }

    #[tokio::test]
    async fn failure_does_not_commit() {
        let commits = Arc::new(Commits::default());
        let outcome = adapter()
            .dispatch(&session(&commits), message("orders", 4, b"bad"))
            .await;

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(commits.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_topic_is_skipped_without_commit() {
        let commits = Arc::new(Commits::default());
        let outcome = adapter()
            .dispatch(&session(&commits), message("payments", 0, b"ok"))
            .await;

        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(commits.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure() {
        let commits = Arc::new(Commits::default());
        let outcome = adapter()
            .dispatch(&session(&commits), message("poison", 0, b"ok"))
            .await;

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(commits.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_loop_keeps_going_after_failure() {
        let commits = Arc::new(Commits::default());
        let session = session(&commits);
        let adapter = adapter();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(message("orders", 0, b"ok")).await.unwrap();
        tx.send(message("orders", 1, b"bad")).await.unwrap();
        tx.send(message("orders", 2, b"ok")).await.unwrap();
        drop(tx);

        adapter
            .consume_claim(&session, PartitionClaim::new("orders", 0, rx))
            .await
            .unwrap();

        assert_eq!(commits.0.lock().unwrap().as_slice(), [1, 3]);
    }

    #[tokio::test]
    async fn panic_before_the_future_is_built_is_a_failure() {
        let commits = Arc::new(Commits::default());
        let session = session(&commits);
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(message("eager", 0, b"poison")).await.unwrap();
        tx.send(message("eager", 1, b"fine")).await.unwrap();
        drop(tx);

        adapter()
            .consume_claim(&session, PartitionClaim::new("eager", 0, rx))
            .await
            .unwrap();

        assert_eq!(commits.0.lock().unwrap().as_slice(), [2]);
    }

    #[tokio::test]
    async fn ended_session_stops_the_claim_loop() {
        let commits = Arc::new(Commits::default());
        let session = session(&commits);
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(message("orders", 0, b"ok")).await.unwrap();
        tx.send(message("orders", 1, b"ok")).await.unwrap();
        drop(tx);
        session.end();

        adapter()
            .consume_claim(&session, PartitionClaim::new("orders", 0, rx))
            .await
            .unwrap();

        assert!(commits.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_span_links_to_pool_span() {
        let tracer = fluxgate_testing::RecordingTracer::new();
        let mut registry = TopicRegistry::default();
        let ok: Arc<dyn Handler> =
            Arc::new(|_ctx: MessageContext, _payload: Vec<u8>| async { Ok::<(), anyhow::Error>(()) });
        registry.register("orders", ok).unwrap();
        let adapter = SessionAdapter::new(Arc::new(registry), Arc::new(tracer.clone()));
        let commits = Arc::new(Commits::default());
        let session = session(&commits);

        adapter.dispatch(&session, message("orders", 0, b"ok")).await;
        adapter.dispatch(&session, message("payments", 0, b"ok")).await;

        let pool = tracer.spans_named("pool orders");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].kind, SpanKind::Consumer);
        assert_eq!(
            pool[0].string_attribute(attributes::MESSAGING_OPERATION_NAME),
            Some("receive")
        );

        let process = tracer.spans_named("process orders");
        assert_eq!(process.len(), 1);
        assert_eq!(process[0].links.len(), 1);
        assert_eq!(process[0].links[0].name, "pool orders");
        assert!(process[0].ended && pool[0].ended);

        // Unregistered topics are received but never processed.
        assert_eq!(tracer.spans_named("pool payments").len(), 1);
        assert!(tracer.spans_named("process payments").is_empty());
    }
}
