//! One consumer-group generation, independent of the Kafka client.
//!
//! Every assigned partition gets its own message source and its own feeder
//! task, so a slow or hung handler only backs up its own partition. The main
//! source is polled for the rest of the generation: it drives the client's
//! rebalance callbacks and carries messages fetched before the partition
//! sources existed, which are routed to the owning partition ahead of
//! anything its own source yields.

use fluxgate_core::broker::{BrokerError, GroupHandler, GroupSession, PartitionClaim, TopicPartition};
use fluxgate_core::message::ConsumedMessage;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Messages buffered between a partition's feeder and its claim loop.
pub(crate) const CLAIM_BUFFER: usize = 256;

/// Messages of one assigned partition.
pub(crate) type PartitionSource = BoxStream<'static, Result<ConsumedMessage, BrokerError>>;

/// Run one generation.
///
/// Calls `setup`, starts one claim loop per entry of `partitions`, and runs
/// until `boundary` resolves or `main` fails. The session is then ended, the
/// feeders are stopped, every claim loop is awaited and `cleanup` runs.
///
/// Returns the `boundary` result, or the error that ended `main`.
pub(crate) async fn run_generation<M, B>(
    session: Arc<GroupSession>,
    handler: Arc<dyn GroupHandler>,
    partitions: Vec<(TopicPartition, PartitionSource)>,
    early: Vec<ConsumedMessage>,
    mut main: M,
    boundary: B,
) -> Result<(), BrokerError>
where
    M: Stream<Item = Result<ConsumedMessage, BrokerError>> + Unpin,
    B: Future<Output = Result<(), BrokerError>>,
{
    handler.setup(&session)?;

    let mut strays: HashMap<TopicPartition, mpsc::UnboundedSender<ConsumedMessage>> = HashMap::new();
    let mut feeders = JoinSet::new();
    let mut claims = JoinSet::new();

    for (partition, source) in partitions {
        let (claim_tx, claim_rx) = mpsc::channel(CLAIM_BUFFER);
        let (stray_tx, stray_rx) = mpsc::unbounded_channel();
        feeders.spawn(feed_partition(source, stray_rx, claim_tx));

        let claim = PartitionClaim::new(partition.topic.clone(), partition.partition, claim_rx);
        let handler = Arc::clone(&handler);
        let session = Arc::clone(&session);
        claims.spawn(async move {
            if let Err(e) = handler.consume_claim(&session, claim).await {
                tracing::warn!(error = %e, "Claim loop ended with an error");
            }
        });

        strays.insert(partition, stray_tx);
    }

    for message in early {
        route_stray(&strays, message);
    }

    tokio::pin!(boundary);
    let outcome = loop {
        tokio::select! {
            biased;
            result = &mut boundary => break result,
            next = main.next() => match next {
                Some(Ok(message)) => route_stray(&strays, message),
                Some(Err(e)) => break Err(e),
                None => break Err(BrokerError::Closed),
            },
        }
    };

    session.end();
    drop(strays);
    feeders.shutdown().await;
    while let Some(joined) = claims.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Claim task panicked");
        }
    }

    handler.cleanup(&session)?;
    outcome
}

/// Forward one partition's messages into its claim, strays first.
async fn feed_partition(
    mut source: PartitionSource,
    mut strays: mpsc::UnboundedReceiver<ConsumedMessage>,
    claim: mpsc::Sender<ConsumedMessage>,
) {
    loop {
        let message = tokio::select! {
            biased;
            Some(message) = strays.recv() => message,
            next = source.next() => match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Partition queue reported an error");
                    continue;
                },
                None => return,
            },
        };

        if claim.send(message).await.is_err() {
            return;
        }
    }
}

fn route_stray(
    strays: &HashMap<TopicPartition, mpsc::UnboundedSender<ConsumedMessage>>,
    message: ConsumedMessage,
) {
    let partition = TopicPartition::new(message.topic.clone(), message.partition);
    match strays.get(&partition) {
        Some(tx) => {
            if tx.send(message).is_err() {
                tracing::debug!(%partition, "Feeder already stopped, message left for redelivery");
            }
        },
        None => tracing::debug!(
            %partition,
            offset = message.offset,
            "Message for an unassigned partition, left for redelivery"
        ),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use fluxgate_core::broker::{BrokerFuture, OffsetCommitter};
    use fluxgate_testing::eventually;
    use futures::channel::mpsc as stream_channel;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Commits(Mutex<Vec<(i32, i64)>>);

    impl Commits {
        fn next_offset(&self, partition: i32) -> Option<i64> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == partition)
                .map(|(_, next)| *next)
                .max()
        }
    }

    impl OffsetCommitter for Commits {
        fn commit(&self, _topic: &str, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push((partition, next_offset));
            Ok(())
        }
    }

    /// Commits every message, except that partition 0 never returns when
    /// `hang_partition_zero` is set.
    #[derive(Default)]
    struct Committing {
        hang_partition_zero: bool,
        setups: AtomicUsize,
        cleanups: AtomicUsize,
        seen: Mutex<Vec<(i32, i64)>>,
    }

    impl GroupHandler for Committing {
        fn setup(&self, _session: &GroupSession) -> Result<(), BrokerError> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cleanup(&self, _session: &GroupSession) -> Result<(), BrokerError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn consume_claim<'a>(
            &'a self,
            session: &'a GroupSession,
            mut claim: PartitionClaim,
        ) -> BrokerFuture<'a, ()> {
            Box::pin(async move {
                while let Some(message) = claim.next().await {
                    if session.is_ended() {
                        break;
                    }
                    if self.hang_partition_zero && message.partition == 0 {
                        std::future::pending::<()>().await;
                    }
                    self.seen.lock().unwrap().push((message.partition, message.offset));
                    let _ = session.mark_message(&message);
                }
                Ok(())
            })
        }
    }

    fn message(partition: i32, offset: i64) -> ConsumedMessage {
        ConsumedMessage {
            topic: "orders".to_string(),
            partition,
            offset,
            key: None,
            payload: Vec::new(),
            timestamp: None,
        }
    }

    fn session(partitions: &[i32], commits: &Arc<Commits>) -> Arc<GroupSession> {
        Arc::new(GroupSession::new(
            1,
            "member-1",
            partitions
                .iter()
                .map(|p| TopicPartition::new("orders", *p))
                .collect(),
            Arc::clone(commits) as Arc<dyn OffsetCommitter>,
        ))
    }

    fn source(messages: Vec<ConsumedMessage>) -> PartitionSource {
        futures::stream::iter(messages.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .boxed()
    }

    #[tokio::test]
    async fn hung_partition_does_not_stall_the_others() {
        let commits = Arc::new(Commits::default());
        let handler = Arc::new(Committing {
            hang_partition_zero: true,
            ..Committing::default()
        });
        let burst = i64::try_from(CLAIM_BUFFER).unwrap() + 10;
        let partitions = vec![
            (
                TopicPartition::new("orders", 0),
                source((0..burst).map(|offset| message(0, offset)).collect()),
            ),
            (
                TopicPartition::new("orders", 1),
                source((0..3).map(|offset| message(1, offset)).collect()),
            ),
        ];
        let (_main_tx, main_rx) = stream_channel::unbounded();

        let generation = tokio::spawn(run_generation(
            session(&[0, 1], &commits),
            Arc::clone(&handler) as Arc<dyn GroupHandler>,
            partitions,
            Vec::new(),
            main_rx,
            std::future::pending(),
        ));

        eventually(Duration::from_secs(5), || commits.next_offset(1) == Some(3)).await;
        assert_eq!(commits.next_offset(0), None);

        generation.abort();
    }

    #[tokio::test]
    async fn boundary_ends_the_generation_and_runs_cleanup() {
        let commits = Arc::new(Commits::default());
        let handler = Arc::new(Committing::default());
        let session = session(&[0], &commits);
        let (boundary_tx, boundary_rx) = oneshot::channel::<()>();
        let (_main_tx, main_rx) = stream_channel::unbounded();

        let generation = tokio::spawn(run_generation(
            Arc::clone(&session),
            Arc::clone(&handler) as Arc<dyn GroupHandler>,
            vec![(
                TopicPartition::new("orders", 0),
                source(vec![message(0, 0), message(0, 1)]),
            )],
            Vec::new(),
            main_rx,
            async move {
                let _ = boundary_rx.await;
                Ok(())
            },
        ));

        eventually(Duration::from_secs(5), || commits.next_offset(0) == Some(2)).await;
        boundary_tx.send(()).unwrap();

        assert_eq!(generation.await.unwrap(), Ok(()));
        assert!(session.is_ended());
        assert_eq!(handler.setups.load(Ordering::SeqCst), 1);
        assert_eq!(handler.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn early_and_main_stream_messages_reach_their_partition_first() {
        let commits = Arc::new(Commits::default());
        let handler = Arc::new(Committing::default());
        let (main_tx, main_rx) = stream_channel::unbounded();
        main_tx.unbounded_send(Ok(message(1, 1))).unwrap();

        let generation = tokio::spawn(run_generation(
            session(&[0, 1], &commits),
            Arc::clone(&handler) as Arc<dyn GroupHandler>,
            vec![
                (TopicPartition::new("orders", 0), source(vec![message(0, 1)])),
                (TopicPartition::new("orders", 1), source(vec![message(1, 2)])),
            ],
            vec![message(0, 0), message(1, 0)],
            main_rx,
            std::future::pending(),
        ));

        eventually(Duration::from_secs(5), || {
            commits.next_offset(0) == Some(2) && commits.next_offset(1) == Some(3)
        })
        .await;
        generation.abort();

        let seen = handler.seen.lock().unwrap().clone();
        let offsets = |partition: i32| -> Vec<i64> {
            seen.iter()
                .filter(|(p, _)| *p == partition)
                .map(|(_, offset)| *offset)
                .collect()
        };
        assert_eq!(offsets(0), [0, 1]);
        assert_eq!(offsets(1), [0, 1, 2]);
    }

    #[tokio::test]
    async fn main_stream_error_ends_the_generation() {
        let commits = Arc::new(Commits::default());
        let handler = Arc::new(Committing::default());
        let (main_tx, main_rx) = stream_channel::unbounded();
        main_tx
            .unbounded_send(Err(BrokerError::Transport("broker down".to_string())))
            .unwrap();

        let result = run_generation(
            session(&[0], &commits),
            Arc::clone(&handler) as Arc<dyn GroupHandler>,
            vec![(TopicPartition::new("orders", 0), source(Vec::new()))],
            Vec::new(),
            main_rx,
            std::future::pending(),
        )
        .await;

        assert_eq!(result, Err(BrokerError::Transport("broker down".to_string())));
        assert_eq!(handler.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_main_stream_means_closed() {
        let commits = Arc::new(Commits::default());
        let handler = Arc::new(Committing::default());
        let (main_tx, main_rx) = stream_channel::unbounded::<Result<ConsumedMessage, BrokerError>>();
        drop(main_tx);

        let result = run_generation(
            session(&[], &commits),
            handler as Arc<dyn GroupHandler>,
            Vec::new(),
            Vec::new(),
            main_rx,
            std::future::pending(),
        )
        .await;

        assert_eq!(result, Err(BrokerError::Closed));
    }
}
