//! Message handlers.
//!
//! A [`Handler`] receives the raw payload of every message consumed from the
//! topic it is bound to. Returning `Ok(())` commits the message; returning an
//! error leaves it uncommitted so it is redelivered after the next rebalance
//! or restart.
//!
//! Any `async` closure taking `(MessageContext, Vec<u8>)` is a handler:
//!
//! ```
//! use fluxgate_core::handler::{Handler, MessageContext};
//!
//! fn assert_handler<H: Handler>(_: H) {}
//!
//! assert_handler(|ctx: MessageContext, payload: Vec<u8>| async move {
//!     println!("{} bytes from {}@{}", payload.len(), ctx.topic, ctx.offset);
//!     Ok::<(), anyhow::Error>(())
//! });
//! ```
//!
//! Handlers are awaited inline by the partition loop. Work spawned in the
//! background and not awaited does not influence the commit decision.

use crate::message::ConsumedMessage;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Future returned by [`Handler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Metadata of the message being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Partition-local offset
    pub offset: i64,
    /// Partitioning key, if any
    pub key: Option<String>,
    /// Message timestamp, if any
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&ConsumedMessage> for MessageContext {
    fn from(message: &ConsumedMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.clone(),
            timestamp: message.timestamp,
        }
    }
}

/// Processes the payload of one consumed message.
///
/// # Dyn Compatibility
///
/// Returns `Pin<Box<dyn Future>>` so handlers can be stored as
/// `Arc<dyn Handler>` in the topic registry.
pub trait Handler: Send + Sync {
    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Any error marks the message as failed: it is not committed and will be
    /// delivered again.
    fn handle(&self, ctx: MessageContext, payload: Vec<u8>) -> HandlerFuture<'_>;
}

impl<F, Fut> Handler for F
where
    F: Fn(MessageContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: MessageContext, payload: Vec<u8>) -> HandlerFuture<'_> {
        Box::pin(self(ctx, payload))
    }
}

/// Handler that decodes a JSON payload into `T` before calling `inner`.
///
/// A payload that does not decode is a handler failure.
pub struct JsonHandler<T, F> {
    inner: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> JsonHandler<T, F> {
    /// Wrap a typed handler function.
    pub const fn new(inner: F) -> Self {
        Self {
            inner,
            _payload: PhantomData,
        }
    }
}

impl<T, F, Fut> Handler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(MessageContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: MessageContext, payload: Vec<u8>) -> HandlerFuture<'_> {
        match serde_json::from_slice::<T>(&payload) {
            Ok(value) => Box::pin((self.inner)(ctx, value)),
            Err(e) => {
                let err = anyhow::anyhow!(
                    "failed to decode JSON payload from {}@{}: {e}",
                    ctx.topic,
                    ctx.offset
                );
                Box::pin(async move { Err::<(), anyhow::Error>(err) })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn ctx(offset: i64) -> MessageContext {
        MessageContext {
            topic: "orders".to_string(),
            partition: 0,
            offset,
            key: None,
            timestamp: None,
        }
    }

    #[derive(Deserialize)]
    struct Order {
        id: i64,
    }

    #[test]
    fn closures_are_handlers() {
        let handler: Arc<dyn Handler> = Arc::new(|ctx: MessageContext, payload: Vec<u8>| async move {
            anyhow::ensure!(payload == b"ok", "unexpected payload at {}", ctx.offset);
            Ok::<(), anyhow::Error>(())
        });

        tokio_test::assert_ok!(tokio_test::block_on(handler.handle(ctx(1), b"ok".to_vec())));
        tokio_test::assert_err!(tokio_test::block_on(handler.handle(ctx(2), b"nope".to_vec())));
    }

    #[tokio::test]
    async fn json_handler_decodes_payload() {
        let seen = Arc::new(AtomicI64::new(0));
        let seen_clone = Arc::clone(&seen);
        let handler = JsonHandler::new(move |_ctx: MessageContext, order: Order| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.store(order.id, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        handler.handle(ctx(0), br#"{"id":7}"#.to_vec()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn json_handler_fails_on_bad_payload() {
        let handler = JsonHandler::new(|_ctx: MessageContext, _order: Order| async {
            Ok::<(), anyhow::Error>(())
        });

        let err = handler.handle(ctx(3), b"not json".to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("orders@3"));
    }
}
