//! Translation of [`BrokerConfig`] into librdkafka client properties.

use fluxgate_core::config::{BrokerConfig, ConsumerConfig};
use rdkafka::config::ClientConfig;

/// Properties for the producer connection.
#[must_use]
pub fn producer_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("acks", config.producer.acks.as_kafka_value())
        .set("message.timeout.ms", config.producer.send_timeout_ms.to_string());
    client
}

/// Properties for the consumer-group connection.
///
/// Partition EOF events are disabled; an idle partition is not an error.
#[must_use]
pub fn consumer_config(config: &BrokerConfig, consumer: &ConsumerConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("group.id", &consumer.group_id)
        .set("enable.auto.commit", consumer.auto_commit.to_string())
        .set("auto.offset.reset", consumer.auto_offset_reset.as_kafka_value())
        .set("session.timeout.ms", consumer.session_timeout_ms.to_string())
        .set("enable.partition.eof", "false");
    client
}

fn base_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("security.protocol", if config.tls { "ssl" } else { "plaintext" });
    if let Some(client_id) = &config.client_id {
        client.set("client.id", client_id);
    }
    client
}
