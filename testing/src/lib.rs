//! # Fluxgate Testing
//!
//! Testing utilities for the Fluxgate messaging gateway.
//!
//! This crate provides:
//! - An in-memory broker with a producer and a consumer group that can be
//!   forced to rebalance or fail on demand
//! - A tracer that records spans for assertions
//! - [`eventually`] for asserting on asynchronous effects
//!
//! ## Example
//!
//! ```ignore
//! use fluxgate_testing::{InMemoryBroker, RecordingTracer};
//!
//! #[tokio::test]
//! async fn test_orders_flow() {
//!     let broker = InMemoryBroker::new();
//!     let group = broker.consumer_group("orders-service");
//!     let tracer = RecordingTracer::new();
//!
//!     let mut gateway = Gateway::builder(config)
//!         .producer(Arc::new(broker.producer()))
//!         .consumer_group(Arc::new(group.clone()))
//!         .tracer(Arc::new(tracer.clone()))
//!         .build()?;
//!     // ...
//! }
//! ```

use std::time::Duration;

/// In-memory broker, producer and consumer group
pub mod broker_mocks;

/// Span recording
pub mod tracer_mocks;

pub use broker_mocks::{InMemoryBroker, InMemoryConsumerGroup, InMemoryProducer};
pub use tracer_mocks::{RecordedSpan, RecordingTracer};

/// Poll `condition` every few milliseconds until it holds.
///
/// # Panics
///
/// Panics if `condition` is still false after `timeout`.
pub async fn eventually<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
