//! # Fluxgate Runtime
//!
//! The messaging gateway and its moving parts.
//!
//! ## Core Components
//!
//! - **[`Gateway`]**: owns the connections, the topic registry and the consume supervisor
//! - **[`SessionAdapter`]**: runs handlers for each partition claim and commits on success
//! - **[`ConsumeRetryPolicy`]**: backoff between consumer-group errors
//! - **[`TracingTracer`]**: spans as `tracing` spans with messaging fields
//! - **[`metrics`]**: Prometheus counters and histograms
//!
//! ## Example
//!
//! ```ignore
//! use fluxgate_core::{BrokerConfig, MessageContext};
//! use fluxgate_runtime::Gateway;
//!
//! let config = BrokerConfig::builder()
//!     .broker("localhost:9092")
//!     .group_id("orders-service")
//!     .build()?;
//!
//! let mut gateway = Gateway::builder(config)
//!     .producer(producer)
//!     .consumer_group(group)
//!     .build()?;
//!
//! gateway.add_consumer("orders", |ctx: MessageContext, payload: Vec<u8>| async move {
//!     tracing::info!(offset = ctx.offset, bytes = payload.len(), "order");
//!     Ok::<(), anyhow::Error>(())
//! })?;
//!
//! gateway.start()?;
//! ```

pub mod gateway;
pub mod metrics;
pub mod retry;
pub mod session;
pub mod telemetry;

pub use gateway::{Gateway, GatewayBuilder, GatewayError};
pub use retry::ConsumeRetryPolicy;
pub use session::{DispatchOutcome, SessionAdapter};
pub use telemetry::{TracingTracer, init_logging};
