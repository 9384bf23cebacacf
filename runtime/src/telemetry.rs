//! Logging setup and the `tracing`-backed [`Tracer`].
//!
//! [`TracingTracer`] turns gateway spans into `tracing` spans whose fields
//! follow the OpenTelemetry messaging conventions (`otel.name`, `otel.kind`,
//! `messaging.*`), so a `tracing-opentelemetry` layer installed by the
//! application exports them unchanged.

use fluxgate_core::telemetry::{
    Attribute, AttributeValue, Span, SpanGuard, SpanKind, SpanLink, Tracer,
};
use thiserror::Error;
use tracing::field::Empty;
use tracing_subscriber::EnvFilter;

/// Errors from logging setup.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// A global subscriber is already installed or the filter is invalid
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (for example `"info,fluxgate_runtime=debug"`).
///
/// # Errors
///
/// Returns [`TelemetryError::Install`] if a global subscriber already exists.
pub fn init_logging(default_filter: &str) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))?;

    tracing::info!(filter = default_filter, "Logging initialized");
    Ok(())
}

/// [`Tracer`] emitting `tracing` spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, name: &str, kind: SpanKind, attributes: Vec<Attribute>) -> SpanGuard {
        self.start_linked_span(name, kind, attributes, Vec::new())
    }

    fn start_linked_span(
        &self,
        name: &str,
        kind: SpanKind,
        attributes: Vec<Attribute>,
        links: Vec<SpanLink>,
    ) -> SpanGuard {
        let span = tracing::info_span!(
            "messaging",
            otel.name = %name,
            otel.kind = kind.as_str(),
            otel.status_code = Empty,
            error.message = Empty,
            messaging.system = Empty,
            messaging.destination.name = Empty,
            messaging.operation.name = Empty,
            messaging.operation.type = Empty,
            messaging.kafka.offset = Empty,
            messaging.kafka.message.key = Empty,
            messaging.destination.partition.id = Empty,
        );

        // Span ids are non-zero; a link without one has nothing to follow.
        for id in links.iter().filter_map(|link| link.id).filter(|id| *id != 0) {
            span.follows_from(tracing::Id::from_u64(id));
        }

        let mut traced = TracingSpan {
            name: name.to_string(),
            span,
        };
        for attribute in attributes {
            traced.set_attribute(attribute);
        }
        SpanGuard::new(Box::new(traced))
    }
}

struct TracingSpan {
    name: String,
    span: tracing::Span,
}

impl Span for TracingSpan {
    fn set_attribute(&mut self, attribute: Attribute) {
        match attribute.value {
            AttributeValue::String(value) => {
                self.span.record(attribute.key, value.as_str());
            },
            AttributeValue::I64(value) => {
                self.span.record(attribute.key, value);
            },
        }
    }

    fn set_error(&mut self, message: &str) {
        self.span.record("otel.status_code", "ERROR");
        self.span.record("error.message", message);
        tracing::warn!(parent: &self.span, error = message, "Span recorded an error");
    }

    fn end(&mut self) {
        self.span = tracing::Span::none();
    }

    fn link(&self) -> Option<SpanLink> {
        Some(SpanLink {
            name: self.name.clone(),
            id: self.span.id().map(|id| id.into_u64()),
        })
    }
}
