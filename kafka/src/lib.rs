//! Kafka connections for the Fluxgate messaging gateway.
//!
//! This crate implements the gateway's [`Producer`] and [`ConsumerGroup`]
//! seams over rdkafka, and wires them into a
//! [`GatewayBuilder`](fluxgate_runtime::GatewayBuilder).
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - An offset is committed only after the handler for that message succeeds
//! - A failed message is redelivered after the next rebalance or restart, unless
//!   a later message of the same partition was committed first
//! - Ordering is guaranteed within a partition, never across partitions
//!
//! With `auto_commit` enabled librdkafka commits consumed positions on its own
//! schedule, regardless of handler outcome.
//!
//! # Example
//!
//! ```no_run
//! use fluxgate_core::config::BrokerConfig;
//! use fluxgate_core::handler::MessageContext;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::builder()
//!     .broker("localhost:9092")
//!     .group_id("orders-service")
//!     .build()?;
//!
//! let mut gateway = fluxgate_kafka::gateway_builder(&config)?.build()?;
//! gateway.add_consumer("orders", |ctx: MessageContext, payload: Vec<u8>| async move {
//!     tracing::info!(offset = ctx.offset, bytes = payload.len(), "order received");
//!     Ok::<(), anyhow::Error>(())
//! })?;
//!
//! gateway.start()?;
//! gateway.produce("orders", br#"{"id":1}"#.to_vec(), Some("customer-1")).await?;
//! gateway.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod client_config;
pub mod consumer;
mod fanout;
pub mod producer;

pub use consumer::KafkaConsumerGroup;
pub use producer::KafkaProducer;

use fluxgate_core::broker::{ConsumerGroup, Producer};
use fluxgate_core::config::BrokerConfig;
use fluxgate_runtime::{Gateway, GatewayBuilder, GatewayError};
use std::sync::Arc;

/// Open the producer connection and, when `config` names a consumer group,
/// the consumer-group connection, and return a gateway builder using them.
///
/// Connections are opened once; nothing is retried here.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] for an invalid configuration and
/// [`GatewayError::Connection`] if either connection cannot be opened.
pub fn gateway_builder(config: &BrokerConfig) -> Result<GatewayBuilder, GatewayError> {
    config.validate()?;

    let producer: Arc<dyn Producer> = Arc::new(
        KafkaProducer::connect(config).map_err(|e| GatewayError::Connection(e.to_string()))?,
    );
    let mut builder = Gateway::builder(config.clone()).producer(producer);

    if config.consumer.is_some() {
        let group: Arc<dyn ConsumerGroup> = Arc::new(
            KafkaConsumerGroup::connect(config)
                .map_err(|e| GatewayError::Connection(e.to_string()))?,
        );
        builder = builder.consumer_group(group);
    }

    Ok(builder)
}
