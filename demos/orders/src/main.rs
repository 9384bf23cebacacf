//! Order events through the gateway.
//!
//! Publishes a few orders and logs each one as it is consumed back.
//!
//! ```bash
//! docker run -d -p 9092:9092 apache/kafka:3.8.0
//! FLUXGATE_KAFKA_BROKERS=localhost:9092 cargo run -p fluxgate-orders-demo
//! ```
//!
//! Stop with Ctrl+C.

use chrono::{DateTime, Utc};
use fluxgate_core::config::{BrokerConfig, ConsumerConfig};
use fluxgate_core::handler::MessageContext;
use fluxgate_runtime::metrics::MetricsExporter;
use fluxgate_runtime::{ConsumeRetryPolicy, init_logging};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ORDERS_TOPIC: &str = "orders";

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    id: u64,
    customer: String,
    total_cents: u64,
    placed_at: DateTime<Utc>,
}

async fn handle_order(ctx: MessageContext, order: OrderPlaced) -> anyhow::Result<()> {
    anyhow::ensure!(order.total_cents > 0, "order {} has no total", order.id);

    tracing::info!(
        order_id = order.id,
        customer = %order.customer,
        total_cents = order.total_cents,
        partition = ctx.partition,
        offset = ctx.offset,
        "Order received"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info,fluxgate_runtime=debug,fluxgate_kafka=debug")?;

    let mut config = BrokerConfig::from_env()?;
    if config.consumer.is_none() {
        config.consumer = Some(ConsumerConfig::new("orders-demo"));
    }

    let mut exporter = MetricsExporter::new();
    exporter.install()?;

    let mut gateway = fluxgate_kafka::gateway_builder(&config)?
        .retry_policy(
            ConsumeRetryPolicy::builder()
                .initial_delay(Duration::from_millis(250))
                .max_delay(Duration::from_secs(10))
                .build(),
        )
        .build()?;

    gateway.check_connection(Duration::from_secs(10)).await?;
    gateway.add_json_consumer(ORDERS_TOPIC, handle_order)?;
    gateway.start()?;

    for id in 1..=3_u64 {
        let order = OrderPlaced {
            id,
            customer: format!("customer-{}", id % 2),
            total_cents: id * 1_250,
            placed_at: Utc::now(),
        };
        let delivery = gateway
            .produce_json(ORDERS_TOPIC, &order, Some(&order.customer))
            .await?;
        tracing::info!(
            order_id = id,
            partition = delivery.partition,
            offset = delivery.offset,
            "Order published"
        );
    }

    tracing::info!("Waiting for Ctrl+C");
    tokio::signal::ctrl_c().await?;

    gateway.stop().await?;

    if let Some(rendered) = exporter.render() {
        tracing::info!(metrics = %rendered, "Final metrics");
    }
    Ok(())
}
