//! Span recording for assertions on tracing behaviour.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use fluxgate_core::telemetry::{
    Attribute, AttributeValue, Span, SpanGuard, SpanKind, SpanLink, Tracer,
};
use std::sync::{Arc, Mutex};

/// A span captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSpan {
    /// Span name, e.g. `send orders`
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Attributes in the order they were set; later values overwrite
    pub attributes: Vec<Attribute>,
    /// Error message, if the span failed
    pub error: Option<String>,
    /// Whether the span was ended
    pub ended: bool,
    /// Spans this one links to
    pub links: Vec<SpanLink>,
}

impl RecordedSpan {
    /// Value of attribute `key`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|attribute| attribute.key == key)
            .map(|attribute| &attribute.value)
    }

    /// String value of attribute `key`.
    #[must_use]
    pub fn string_attribute(&self, key: &str) -> Option<&str> {
        match self.attribute(key) {
            Some(AttributeValue::String(value)) => Some(value),
            _ => None,
        }
    }

    /// Whether an error was recorded.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// [`Tracer`] that keeps every span in memory.
///
/// # Example
///
/// ```
/// use fluxgate_core::telemetry::{SpanKind, Tracer};
/// use fluxgate_testing::RecordingTracer;
///
/// let tracer = RecordingTracer::new();
/// drop(tracer.start_span("send orders", SpanKind::Producer, Vec::new()));
///
/// let spans = tracer.spans();
/// assert_eq!(spans.len(), 1);
/// assert!(spans[0].ended);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every span started so far.
    #[must_use]
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().unwrap().clone()
    }

    /// Spans whose name is `name`.
    #[must_use]
    pub fn spans_named(&self, name: &str) -> Vec<RecordedSpan> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .filter(|span| span.name == name)
            .cloned()
            .collect()
    }

    /// Forget all recorded spans.
    pub fn clear(&self) {
        self.spans.lock().unwrap().clear();
    }
}

impl Tracer for RecordingTracer {
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
        let index = {
            let mut spans = self.spans.lock().unwrap();
            spans.push(RecordedSpan {
                name: name.to_string(),
                kind,
                attributes: Vec::new(),
                error: None,
                ended: false,
                links,
            });
            spans.len() - 1
        };

        let mut span = RecordingSpan {
            spans: Arc::clone(&self.spans),
            name: name.to_string(),
            index,
        };
        for attribute in attributes {
            span.set_attribute(attribute);
        }
        SpanGuard::new(Box::new(span))
    }
}

struct RecordingSpan {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
    name: String,
    index: usize,
}

impl RecordingSpan {
    fn update(&self, f: impl FnOnce(&mut RecordedSpan)) {
        if let Some(span) = self.spans.lock().unwrap().get_mut(self.index) {
            f(span);
        }
    }
}

impl Span for RecordingSpan {
    fn set_attribute(&mut self, attribute: Attribute) {
        self.update(|span| {
            match span.attributes.iter_mut().find(|a| a.key == attribute.key) {
                Some(existing) => existing.value = attribute.value,
                None => span.attributes.push(attribute),
            }
        });
    }

    fn set_error(&mut self, message: &str) {
        self.update(|span| span.error = Some(message.to_string()));
    }

    fn end(&mut self) {
        self.update(|span| span.ended = true);
    }

    /// The link id is the span's position in [`RecordingTracer::spans`].
    fn link(&self) -> Option<SpanLink> {
        Some(SpanLink {
            name: self.name.clone(),
            id: u64::try_from(self.index).ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxgate_core::telemetry::attributes;

    #[test]
    fn records_attributes_errors_and_end() {
        let tracer = RecordingTracer::new();
        {
            let mut guard = tracer.start_span(
                "process orders",
                SpanKind::Consumer,
                vec![Attribute::string(attributes::MESSAGING_DESTINATION_NAME, "orders")],
            );
            guard.set_attribute(Attribute::i64(attributes::MESSAGING_KAFKA_OFFSET, 7));
            guard.set_error(&"handler failed");
        }

        let span = &tracer.spans_named("process orders")[0];
        assert_eq!(span.kind, SpanKind::Consumer);
        assert_eq!(
            span.string_attribute(attributes::MESSAGING_DESTINATION_NAME),
            Some("orders")
        );
        assert_eq!(
            span.attribute(attributes::MESSAGING_KAFKA_OFFSET),
            Some(&AttributeValue::I64(7))
        );
        assert_eq!(span.error.as_deref(), Some("handler failed"));
        assert!(span.ended);
    }

    #[test]
    fn later_attribute_overwrites() {
        let tracer = RecordingTracer::new();
        let mut guard = tracer.start_span("send orders", SpanKind::Producer, Vec::new());
        guard.set_attribute(Attribute::i64(attributes::MESSAGING_KAFKA_OFFSET, 1));
        guard.set_attribute(Attribute::i64(attributes::MESSAGING_KAFKA_OFFSET, 2));
        drop(guard);

        let spans = tracer.spans();
        assert_eq!(spans[0].attributes.len(), 1);
        assert_eq!(
            spans[0].attribute(attributes::MESSAGING_KAFKA_OFFSET),
            Some(&AttributeValue::I64(2))
        );
    }

    #[test]
    fn linked_spans_point_at_their_source() {
        let tracer = RecordingTracer::new();
        let pool = tracer.start_span("pool orders", SpanKind::Consumer, Vec::new());
        let link = pool.link().unwrap();
        drop(tracer.start_linked_span("process orders", SpanKind::Consumer, Vec::new(), vec![link]));
        drop(pool);

        let process = &tracer.spans_named("process orders")[0];
        assert_eq!(process.links.len(), 1);
        assert_eq!(process.links[0].name, "pool orders");
        assert_eq!(process.links[0].id, Some(0));
    }
}
