//! Process lifecycle hooks.
//!
//! The application container calls [`Lifecycle::start`] once at boot and
//! [`Lifecycle::stop`] once at shutdown. Components are held as
//! `Arc<dyn Lifecycle>` so the trait returns boxed futures.

use std::future::Future;
use std::pin::Pin;

/// Future returned by lifecycle hooks.
pub type LifecycleFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// A component with start and stop hooks.
pub trait Lifecycle: Send + Sync {
    /// Component name for logging.
    fn name(&self) -> &str;

    /// Start background work.
    ///
    /// # Errors
    ///
    /// An error aborts process startup.
    fn start(&self) -> LifecycleFuture<'_>;

    /// Stop background work and release connections.
    ///
    /// # Errors
    ///
    /// Returns the first cleanup failure; cleanup still runs to completion.
    fn stop(&self) -> LifecycleFuture<'_>;
}
