//! # Fluxgate Core
//!
//! Core traits and types for the Fluxgate messaging gateway.
//!
//! The gateway owns a broker connection, routes inbound messages from many
//! topics to per-topic handlers through a consumer group, and publishes
//! messages with tracing. This crate holds everything that does not depend on
//! a concrete broker client:
//!
//! - [`config`]: [`BrokerConfig`](config::BrokerConfig) and its builder/env loader
//! - [`message`]: outbound and consumed message envelopes
//! - [`handler`]: the [`Handler`](handler::Handler) trait
//! - [`registry`]: topic → handler mapping
//! - [`broker`]: producer and consumer-group seams
//! - [`telemetry`]: tracer seam and span guard
//! - [`lifecycle`]: start/stop hooks
//!
//! ## Delivery semantics
//!
//! - **At-least-once**: a message is committed only after its handler succeeds
//! - **Per-partition order**: a partition's messages reach the handler in offset order
//! - **No cross-partition order**: partitions are processed concurrently

pub mod broker;
pub mod config;
pub mod handler;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod telemetry;

pub use broker::{BrokerError, ConsumerGroup, GroupHandler, GroupSession, PartitionClaim, Producer};
pub use config::{Acks, BrokerConfig, ConfigError, OffsetReset};
pub use handler::{Handler, JsonHandler, MessageContext};
pub use lifecycle::Lifecycle;
pub use message::{ConsumedMessage, Delivery, OutboundMessage};
pub use registry::{DuplicatePolicy, TopicRegistry};
pub use telemetry::{SpanGuard, SpanKind, Tracer};
