//! The messaging gateway.
//!
//! [`Gateway`] owns a producer, an optional consumer group and the topic
//! registry. Handlers are registered during setup with
//! [`Gateway::add_consumer`]; [`Gateway::start`] freezes the registry and
//! spawns a single supervisor task that keeps the consumer group joined;
//! [`Gateway::stop`] closes the consumer group, waits for the supervisor and
//! closes the producer.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut gateway = Gateway::builder(config)
//!     .producer(producer)
//!     .consumer_group(group)
//!     .build()?;
//!
//! gateway.add_consumer("orders", |ctx: MessageContext, payload: Vec<u8>| async move {
//!     tracing::info!(offset = ctx.offset, bytes = payload.len(), "order received");
//!     Ok::<(), anyhow::Error>(())
//! })?;
//!
//! gateway.start()?;
//! gateway.produce("orders", br#"{"id":1}"#.to_vec(), Some("customer-1")).await?;
//! gateway.stop().await?;
//! ```

use crate::metrics::GatewayMetrics;
use crate::retry::ConsumeRetryPolicy;
use crate::session::SessionAdapter;
use crate::telemetry::TracingTracer;
use fluxgate_core::broker::{BrokerError, ConsumerGroup, GroupHandler, Producer};
use fluxgate_core::config::{BrokerConfig, ConfigError};
use fluxgate_core::handler::{Handler, JsonHandler, MessageContext};
use fluxgate_core::lifecycle::{Lifecycle, LifecycleFuture};
use fluxgate_core::message::{Delivery, OutboundMessage};
use fluxgate_core::registry::{DuplicatePolicy, RegistryError, TopicRegistry};
use fluxgate_core::telemetry::{Attribute, SpanKind, Tracer, attributes};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors returned by the gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A broker connection could not be opened
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The topic already has a handler and duplicates are rejected
    #[error("A handler is already registered for topic '{0}'")]
    DuplicateTopic(String),

    /// The operation is only allowed before `start()`
    #[error("Gateway already started")]
    AlreadyStarted,

    /// The gateway was stopped and cannot be restarted
    #[error("Gateway stopped")]
    Stopped,

    /// Consumers are registered but no consumer group was configured
    #[error("Consumers registered but no consumer group is configured")]
    ConsumerGroupUnavailable,

    /// A publish failed
    #[error("Publish failed for topic '{topic}': {reason}")]
    Publish {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// A payload could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Closing a connection failed
    #[error("Shutdown failed: {0}")]
    Shutdown(BrokerError),
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateTopic(topic) => Self::DuplicateTopic(topic),
        }
    }
}

enum LifecycleState {
    Idle,
    Running { supervisor: Option<JoinHandle<()>> },
    Stopped,
}

/// Messaging gateway over a producer and a consumer group.
pub struct Gateway {
    config: BrokerConfig,
    producer: Arc<dyn Producer>,
    consumer_group: Option<Arc<dyn ConsumerGroup>>,
    tracer: Arc<dyn Tracer>,
    retry_policy: ConsumeRetryPolicy,
    stop_timeout: Duration,
    registry: TopicRegistry,
    running: Arc<AtomicBool>,
    state: Mutex<LifecycleState>,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Start building a gateway for `config`.
    #[must_use]
    pub fn builder(config: BrokerConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Configuration the gateway was built with.
    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Whether the consume supervisor is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registered topics, in registration order.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    /// Bind `handler` to `topic`.
    ///
    /// Must be called before [`Gateway::start`]. With
    /// [`DuplicatePolicy::Replace`] a second registration for the same topic
    /// replaces the first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AlreadyStarted`] after `start()` (or
    /// [`GatewayError::Stopped`] after `stop()`) and
    /// [`GatewayError::DuplicateTopic`] under [`DuplicatePolicy::Reject`].
    pub fn add_consumer<H>(&mut self, topic: impl Into<String>, handler: H) -> Result<(), GatewayError>
    where
        H: Handler + 'static,
    {
        self.add_handler(topic, Arc::new(handler))
    }

    /// Bind a shared handler to `topic`.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::add_consumer`].
    pub fn add_handler(
        &mut self,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), GatewayError> {
        match self.state.get_mut().unwrap_or_else(PoisonError::into_inner) {
            LifecycleState::Idle => {},
            LifecycleState::Running { .. } => return Err(GatewayError::AlreadyStarted),
            LifecycleState::Stopped => return Err(GatewayError::Stopped),
        }

        let topic = topic.into();
        self.registry.register(topic.clone(), handler)?;
        tracing::debug!(topic = %topic, "Consumer registered");
        Ok(())
    }

    /// Bind a handler that receives the payload decoded from JSON.
    ///
    /// Payloads that fail to decode are handler failures and stay
    /// uncommitted.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::add_consumer`].
    pub fn add_json_consumer<T, F, Fut>(&mut self, topic: impl Into<String>, handler: F) -> Result<(), GatewayError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(MessageContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_consumer(topic, JsonHandler::new(handler))
    }

    /// Start consuming.
    ///
    /// With no registered consumers this only marks the gateway started
    /// (producer-only mode). Otherwise it freezes the registry and spawns the
    /// supervisor task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AlreadyStarted`] on a second call,
    /// [`GatewayError::Stopped`] after `stop()`, and
    /// [`GatewayError::ConsumerGroupUnavailable`] when consumers are registered
    /// without a consumer group.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) -> Result<(), GatewayError> {
        let mut state = self.lock_state();
        match *state {
            LifecycleState::Idle => {},
            LifecycleState::Running { .. } => return Err(GatewayError::AlreadyStarted),
            LifecycleState::Stopped => return Err(GatewayError::Stopped),
        }

        if self.registry.is_empty() {
            tracing::info!("No consumers registered, running in producer-only mode");
            *state = LifecycleState::Running { supervisor: None };
            return Ok(());
        }

        let group = self
            .consumer_group
            .clone()
            .ok_or(GatewayError::ConsumerGroupUnavailable)?;

        let registry = Arc::new(self.registry.clone());
        let topics = registry.topics();
        let adapter: Arc<dyn GroupHandler> =
            Arc::new(SessionAdapter::new(registry, Arc::clone(&self.tracer)));

        self.running.store(true, Ordering::SeqCst);

        let supervisor = Supervisor {
            group,
            topics: topics.clone(),
            adapter,
            running: Arc::clone(&self.running),
            shutdown: self.shutdown.subscribe(),
            policy: self.retry_policy.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        tracing::info!(
            topics = ?topics,
            group_id = self.config.consumer.as_ref().map(|c| c.group_id.as_str()),
            "Consumer connected"
        );

        *state = LifecycleState::Running {
            supervisor: Some(handle),
        };
        Ok(())
    }

    /// Stop consuming and close both connections.
    ///
    /// The consumer group is closed first, which ends the supervisor's
    /// in-flight `consume`; the producer is closed last. Both closes are
    /// attempted even if the first fails. Calling `stop()` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first close error as [`GatewayError::Shutdown`].
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let supervisor = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, LifecycleState::Stopped) {
                LifecycleState::Running { supervisor } => supervisor,
                LifecycleState::Idle => None,
                LifecycleState::Stopped => return Ok(()),
            }
        };

        let mut first_error: Option<GatewayError> = None;

        if let Some(group) = &self.consumer_group {
            match group.close().await {
                Ok(()) => tracing::info!("Consumer disconnected"),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to close consumer group");
                    first_error.get_or_insert(GatewayError::Shutdown(e));
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        if let Some(handle) = supervisor {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.stop_timeout, handle).await {
                Ok(Ok(())) => tracing::debug!("Consumer supervisor stopped"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Consumer supervisor ended abnormally"),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = u64::try_from(self.stop_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Consumer supervisor did not stop in time, aborting"
                    );
                    abort.abort();
                },
            }
        }

        match self.producer.close().await {
            Ok(()) => tracing::info!("Producer disconnected"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to close producer");
                first_error.get_or_insert(GatewayError::Shutdown(e));
            },
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Publish `payload` to `topic` and wait for the broker acknowledgment.
    ///
    /// A `send {topic}` producer span carries the messaging attributes, the
    /// key when present, and on success the partition and offset.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Publish`] if the broker rejects the message;
    /// the error is also recorded on the span.
    pub async fn produce(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        key: Option<&str>,
    ) -> Result<Delivery, GatewayError> {
        let mut attrs = vec![
            Attribute::string(attributes::MESSAGING_SYSTEM, attributes::SYSTEM_KAFKA),
            Attribute::string(attributes::MESSAGING_DESTINATION_NAME, topic),
            Attribute::string(attributes::MESSAGING_OPERATION_NAME, attributes::OPERATION_SEND),
            Attribute::string(attributes::MESSAGING_OPERATION_TYPE, attributes::OPERATION_SEND),
        ];
        if let Some(key) = key {
            attrs.push(Attribute::string(attributes::MESSAGING_KAFKA_MESSAGE_KEY, key));
        }
        let mut span = self
            .tracer
            .start_span(&format!("send {topic}"), SpanKind::Producer, attrs);

        let mut message = OutboundMessage::new(topic, payload);
        if let Some(key) = key {
            message = message.with_key(key);
        }

        let started = Instant::now();
        match self.producer.send(message).await {
            Ok(delivery) => {
                span.set_attribute(Attribute::string(
                    attributes::MESSAGING_DESTINATION_PARTITION_ID,
                    delivery.partition.to_string(),
                ));
                span.set_attribute(Attribute::i64(
                    attributes::MESSAGING_KAFKA_OFFSET,
                    delivery.offset,
                ));
                GatewayMetrics::record_produce(topic, started.elapsed());
                tracing::debug!(
                    topic = %topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Message published"
                );
                Ok(delivery)
            },
            Err(e) => {
                span.set_error(&e);
                GatewayMetrics::record_produce_error(topic);
                tracing::error!(topic = %topic, error = %e, "Failed to publish message");
                Err(GatewayError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            },
        }
    }

    /// Serialize `value` as JSON and publish it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Serialization`] without sending if `value`
    /// cannot be serialized, otherwise the errors of [`Gateway::produce`].
    pub async fn produce_json<T>(
        &self,
        topic: &str,
        value: &T,
        key: Option<&str>,
    ) -> Result<Delivery, GatewayError>
    where
        T: Serialize + ?Sized,
    {
        let payload =
            serde_json::to_vec(value).map_err(|e| GatewayError::Serialization(e.to_string()))?;
        self.produce(topic, payload, key).await
    }

    /// Verify the cluster is reachable through the producer connection.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] if metadata cannot be fetched
    /// within `timeout`.
    pub async fn check_connection(&self, timeout: Duration) -> Result<(), GatewayError> {
        self.producer
            .check_connection(timeout)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        tracing::debug!(brokers = %self.config.bootstrap_servers(), "Cluster reachable");
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        if let LifecycleState::Running {
            supervisor: Some(handle),
        } = self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
        {
            handle.abort();
        }
    }
}

impl Lifecycle for Gateway {
    fn name(&self) -> &str {
        "kafka"
    }

    fn start(&self) -> LifecycleFuture<'_> {
        Box::pin(async move { Ok(Self::start(self)?) })
    }

    fn stop(&self) -> LifecycleFuture<'_> {
        Box::pin(async move { Ok(Self::stop(self).await?) })
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    config: BrokerConfig,
    producer: Option<Arc<dyn Producer>>,
    consumer_group: Option<Arc<dyn ConsumerGroup>>,
    tracer: Option<Arc<dyn Tracer>>,
    retry_policy: Option<ConsumeRetryPolicy>,
    duplicate_policy: DuplicatePolicy,
    stop_timeout: Option<Duration>,
}

impl GatewayBuilder {
    /// Create a builder for `config`.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            producer: None,
            consumer_group: None,
            tracer: None,
            retry_policy: None,
            duplicate_policy: DuplicatePolicy::default(),
            stop_timeout: None,
        }
    }

    /// Set the producer connection (required).
    #[must_use]
    pub fn producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Set the consumer-group connection.
    #[must_use]
    pub fn consumer_group(mut self, group: Arc<dyn ConsumerGroup>) -> Self {
        self.consumer_group = Some(group);
        self
    }

    /// Set the tracer.
    ///
    /// Default: [`TracingTracer`]
    #[must_use]
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Set the backoff applied when the consumer group errors.
    ///
    /// Default: [`ConsumeRetryPolicy::default`]
    #[must_use]
    pub fn retry_policy(mut self, policy: ConsumeRetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set what happens when a topic is registered twice.
    ///
    /// Default: [`DuplicatePolicy::Replace`]
    #[must_use]
    pub const fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Set how long `stop()` waits for the supervisor to exit.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Build the [`Gateway`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid or no
    /// producer was provided.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        self.config.validate()?;

        let producer = self.producer.ok_or_else(|| {
            ConfigError::ValidationError("a producer connection is required".to_string())
        })?;

        let (shutdown, _) = watch::channel(false);

        Ok(Gateway {
            config: self.config,
            producer,
            consumer_group: self.consumer_group,
            tracer: self.tracer.unwrap_or_else(|| Arc::new(TracingTracer)),
            retry_policy: self.retry_policy.unwrap_or_default(),
            stop_timeout: self.stop_timeout.unwrap_or(Duration::from_secs(10)),
            registry: TopicRegistry::new(self.duplicate_policy),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(LifecycleState::Idle),
            shutdown,
        })
    }
}

/// Keeps the consumer group joined until stopped.
struct Supervisor {
    group: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    adapter: Arc<dyn GroupHandler>,
    running: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    policy: ConsumeRetryPolicy,
}

impl Supervisor {
    async fn run(mut self) {
        let mut failures = 0usize;

        while self.running.load(Ordering::SeqCst) && !*self.shutdown.borrow() {
            match self
                .group
                .consume(&self.topics, Arc::clone(&self.adapter))
                .await
            {
                Ok(()) => {
                    failures = 0;
                    tracing::debug!("Consumer group generation ended, rejoining");
                },
                Err(e) if e.is_closed() => {
                    tracing::debug!("Consumer group closed, supervisor exiting");
                    break;
                },
                Err(e) => {
                    failures += 1;
                    GatewayMetrics::record_consume_error();

                    if self.policy.is_exhausted(failures) {
                        tracing::error!(
                            error = %e,
                            failures,
                            "Consumer group kept failing, giving up"
                        );
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }

                    let delay = self.policy.delay_for_attempt(failures - 1);
                    tracing::warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Error from consumer group, retrying"
                    );

                    tokio::select! {
                        () = wait_for_shutdown(&mut self.shutdown) => break,
                        () = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }

        tracing::debug!("Consumer supervisor exited");
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
