//! Tracer seam.
//!
//! The gateway opens one span per published message and one per consumed
//! message. It only needs "start span", "set attribute" and "record error";
//! everything else (exporters, sampling, propagation) belongs to whatever
//! implements [`Tracer`].
//!
//! Spans are released through [`SpanGuard`]: the span ends when the guard is
//! dropped, so success, error and unwinding paths all close it.

use std::fmt;

/// Semantic-convention attribute keys used by the gateway.
pub mod attributes {
    /// Always `"kafka"`
    pub const MESSAGING_SYSTEM: &str = "messaging.system";
    /// Topic name
    pub const MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name";
    /// `send` or `process`
    pub const MESSAGING_OPERATION_NAME: &str = "messaging.operation.name";
    /// `send` or `process`
    pub const MESSAGING_OPERATION_TYPE: &str = "messaging.operation.type";
    /// Message offset
    pub const MESSAGING_KAFKA_OFFSET: &str = "messaging.kafka.offset";
    /// Message key
    pub const MESSAGING_KAFKA_MESSAGE_KEY: &str = "messaging.kafka.message.key";
    /// Partition, as a string
    pub const MESSAGING_DESTINATION_PARTITION_ID: &str = "messaging.destination.partition.id";

    /// Value of [`MESSAGING_SYSTEM`].
    pub const SYSTEM_KAFKA: &str = "kafka";
    /// Operation value for publishes.
    pub const OPERATION_SEND: &str = "send";
    /// Operation value for consumed messages.
    pub const OPERATION_PROCESS: &str = "process";
    /// Operation value for messages taken off a partition.
    pub const OPERATION_RECEIVE: &str = "receive";
}

/// Role of a span in a messaging flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Publishing side
    Producer,
    /// Consuming side
    Consumer,
    /// Anything else
    Internal,
}

impl SpanKind {
    /// Lowercase name, as used by `otel.kind`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
            Self::Internal => "internal",
        }
    }
}

/// Attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// String value
    String(String),
    /// Integer value
    I64(i64),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::I64(n) => write!(f, "{n}"),
        }
    }
}

/// A key/value pair attached to a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute key
    pub key: &'static str,
    /// Attribute value
    pub value: AttributeValue,
}

impl Attribute {
    /// String attribute.
    #[must_use]
    pub fn string(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: AttributeValue::String(value.into()),
        }
    }

    /// Integer attribute.
    #[must_use]
    pub const fn i64(key: &'static str, value: i64) -> Self {
        Self {
            key,
            value: AttributeValue::I64(value),
        }
    }
}

/// Reference to a started span, carried by a span link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanLink {
    /// Name of the linked span
    pub name: String,
    /// Backend identifier of the linked span, if it has one
    pub id: Option<u64>,
}

/// A live span owned by a [`SpanGuard`].
pub trait Span: Send {
    /// Attach or overwrite an attribute.
    fn set_attribute(&mut self, attribute: Attribute);

    /// Mark the span as failed with `message`.
    fn set_error(&mut self, message: &str);

    /// Finish the span. Called exactly once, by the guard.
    fn end(&mut self);

    /// Reference other spans can link to.
    fn link(&self) -> Option<SpanLink> {
        None
    }
}

/// Source of spans.
pub trait Tracer: Send + Sync {
    /// Start a span named `name`.
    fn start_span(&self, name: &str, kind: SpanKind, attributes: Vec<Attribute>) -> SpanGuard;

    /// Start a span linked to `links` rather than parented by them.
    ///
    /// Tracers without link support start an unlinked span.
    fn start_linked_span(
        &self,
        name: &str,
        kind: SpanKind,
        attributes: Vec<Attribute>,
        links: Vec<SpanLink>,
    ) -> SpanGuard {
        drop(links);
        self.start_span(name, kind, attributes)
    }
}

/// Scoped ownership of a span; ends it on drop.
pub struct SpanGuard {
    span: Option<Box<dyn Span>>,
    failed: bool,
}

impl SpanGuard {
    /// Guard a started span.
    #[must_use]
    pub fn new(span: Box<dyn Span>) -> Self {
        Self {
            span: Some(span),
            failed: false,
        }
    }

    /// Guard that records nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            span: None,
            failed: false,
        }
    }

    /// Attach an attribute.
    pub fn set_attribute(&mut self, attribute: Attribute) {
        if let Some(span) = self.span.as_mut() {
            span.set_attribute(attribute);
        }
    }

    /// Record `error` on the span and mark it failed.
    pub fn set_error(&mut self, error: &dyn fmt::Display) {
        self.failed = true;
        if let Some(span) = self.span.as_mut() {
            span.set_error(&error.to_string());
        }
    }

    /// Whether [`SpanGuard::set_error`] was called.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    /// Link to this span, for spans started with
    /// [`Tracer::start_linked_span`].
    #[must_use]
    pub fn link(&self) -> Option<SpanLink> {
        self.span.as_ref().and_then(|span| span.link())
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(mut span) = self.span.take() {
            span.end();
        }
    }
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard")
            .field("active", &self.span.is_some())
            .field("failed", &self.failed)
            .finish()
    }
}

/// Tracer that produces disabled guards.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, _kind: SpanKind, _attributes: Vec<Attribute>) -> SpanGuard {
        SpanGuard::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counters {
        ended: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    struct CountingSpan(Arc<Counters>);

    impl Span for CountingSpan {
        fn set_attribute(&mut self, _attribute: Attribute) {}

        fn set_error(&mut self, message: &str) {
            #[allow(clippy::unwrap_used)]
            self.0.errors.lock().unwrap().push(message.to_string());
        }

        fn end(&mut self) {
            self.0.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_ends_span_once_on_drop() {
        let counters = Arc::new(Counters::default());
        {
            let mut guard = SpanGuard::new(Box::new(CountingSpan(Arc::clone(&counters))));
            guard.set_error(&"handler failed");
            assert!(guard.is_failed());
        }

        assert_eq!(counters.ended.load(Ordering::SeqCst), 1);
        #[allow(clippy::unwrap_used)]
        let errors = counters.errors.lock().unwrap();
        assert_eq!(errors.as_slice(), ["handler failed"]);
    }

    #[test]
    fn guard_ends_span_when_unwinding() {
        let counters = Arc::new(Counters::default());
        let inner = Arc::clone(&counters);

        let result = std::panic::catch_unwind(move || {
            let _guard = SpanGuard::new(Box::new(CountingSpan(inner)));
            #[allow(clippy::panic)]
            {
                panic!("handler panicked");
            }
        });

        assert!(result.is_err());
        assert_eq!(counters.ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_tracer_guard_is_inert() {
        let mut guard = NoopTracer.start_span("send orders", SpanKind::Producer, Vec::new());
        guard.set_attribute(Attribute::i64(attributes::MESSAGING_KAFKA_OFFSET, 1));
        assert!(!guard.is_failed());
        assert_eq!(guard.link(), None);

        let linked = NoopTracer.start_linked_span(
            "process orders",
            SpanKind::Consumer,
            Vec::new(),
            vec![SpanLink {
                name: "pool orders".to_string(),
                id: Some(1),
            }],
        );
        assert_eq!(linked.link(), None);
    }
}
