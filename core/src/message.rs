//! Message envelopes exchanged with the broker.
//!
//! The gateway adds no framing of its own: a message is a topic, an optional
//! key and an opaque byte payload. Partition and offset are assigned by the
//! broker and are read-only metadata.

use chrono::{DateTime, Utc};

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Create an unkeyed message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
        }
    }

    /// Attach a partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Where the broker stored a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Delivery {
    /// Partition the message landed in
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

/// A message fetched from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Partition-local offset
    pub offset: i64,
    /// Partitioning key, if the producer set one
    pub key: Option<String>,
    /// Opaque payload (empty for tombstones)
    pub payload: Vec<u8>,
    /// Broker or producer timestamp, when available
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumedMessage {
    /// Offset to commit once this message has been processed.
    ///
    /// Kafka commits the position of the *next* message to read.
    #[must_use]
    pub const fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}
