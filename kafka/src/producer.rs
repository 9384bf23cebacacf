//! Producer connection over rdkafka's [`FutureProducer`].

use crate::client_config::producer_config;
use fluxgate_core::broker::{BrokerError, BrokerFuture, Producer};
use fluxgate_core::config::BrokerConfig;
use fluxgate_core::message::{Delivery, OutboundMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Synchronous-send Kafka producer.
///
/// Every [`Producer::send`] waits for the broker acknowledgment required by
/// the configured `acks`, up to the configured send timeout.
///
/// [`Producer::close`] flushes and releases the client; every later call
/// returns [`BrokerError::Closed`].
pub struct KafkaProducer {
    producer: Mutex<Option<FutureProducer>>,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// Open a producer connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if librdkafka rejects the
    /// configuration.
    pub fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = producer_config(config).create().map_err(|e| {
            BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %config.bootstrap_servers(),
            acks = config.producer.acks.as_kafka_value(),
            tls = config.tls,
            "Producer connected"
        );

        Ok(Self {
            producer: Mutex::new(Some(producer)),
            send_timeout: config.producer.send_timeout(),
        })
    }

    fn client(&self) -> Result<FutureProducer, BrokerError> {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::Closed)
    }
}

impl Producer for KafkaProducer {
    fn send(&self, message: OutboundMessage) -> BrokerFuture<'_, Delivery> {
        Box::pin(async move {
            let producer = self.client()?;
            let mut record = FutureRecord::<str, [u8]>::to(&message.topic).payload(&message.payload);
            if let Some(key) = message.key.as_deref() {
                record = record.key(key);
            }

            match producer
                .send(record, Timeout::After(self.send_timeout))
                .await
            {
                Ok((partition, offset)) => Ok(Delivery { partition, offset }),
                Err((kafka_error, _)) => Err(BrokerError::PublishFailed {
                    topic: message.topic.clone(),
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }

    fn check_connection(&self, timeout: Duration) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let producer = self.client()?;
            let brokers = tokio::task::spawn_blocking(move || {
                producer
                    .client()
                    .fetch_metadata(None, timeout)
                    .map(|metadata| metadata.brokers().len())
            })
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to fetch metadata: {e}"))
            })?;

            if brokers == 0 {
                return Err(BrokerError::ConnectionFailed(
                    "Cluster metadata lists no brokers".to_string(),
                ));
            }
            Ok(())
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        let timeout = self.send_timeout;
        Box::pin(async move {
            let producer = self
                .producer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(producer) = producer else {
                return Ok(());
            };

            // The client is dropped with the closure, once flushed.
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?
                .map_err(|e| BrokerError::Transport(format!("Failed to flush producer: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn kafka_producer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaProducer>();
        assert_sync::<KafkaProducer>();
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let config = BrokerConfig::builder().broker("localhost:1").build().unwrap();
        let producer = KafkaProducer::connect(&config).unwrap();
        producer.close().await.unwrap();

        let result = producer
            .send(OutboundMessage::new("orders", b"{}".to_vec()))
            .await;
        assert_eq!(result, Err(BrokerError::Closed));
    }

    #[tokio::test]
    async fn close_releases_the_client() {
        let config = BrokerConfig::builder().broker("localhost:1").build().unwrap();
        let producer = KafkaProducer::connect(&config).unwrap();
        assert!(producer.client().is_ok());

        producer.close().await.unwrap();

        assert!(matches!(producer.client(), Err(BrokerError::Closed)));
        assert_eq!(
            producer.check_connection(Duration::from_millis(10)).await,
            Err(BrokerError::Closed)
        );
        // Idempotent
        producer.close().await.unwrap();
    }
}
