use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

pub async fn create_kafka_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    let client_config = client_config(config);

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer = client_config.create()?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
    #[error("broker acknowledged the send without assigning an offset")]
    DeliveryUnconfirmed,
}

impl From<KafkaError> for KafkaProduceError {
    fn from(error: KafkaError) -> Self {
        KafkaProduceError::KafkaProduceError { error }
    }
}

/// Send one keyed message and block on its delivery report. A `None` payload
/// produces a tombstone (null value, live key), which compacted downstream
/// topics read as a deletion of the keyed entity.
///
/// Returns the broker-assigned (partition, offset) of the delivered message;
/// a delivery report without a real offset is treated as a failed send.
pub async fn send_keyed<T>(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    payload: Option<&T>,
    timeout: Duration,
) -> Result<(i32, i64), KafkaProduceError>
where
    T: Serialize,
{
    let encoded = match payload {
        Some(value) => Some(
            serde_json::to_string(value)
                .map_err(|e| KafkaProduceError::SerializationError { error: e })?,
        ),
        None => None,
    };

    let record = FutureRecord {
        topic,
        partition: None,
        payload: encoded.as_ref(),
        key: Some(key),
        timestamp: None,
        headers: None,
    };

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            if offset < 0 {
                return Err(KafkaProduceError::DeliveryUnconfirmed);
            }
            Ok((partition, offset))
        }
        Err((error, _)) => Err(KafkaProduceError::KafkaProduceError { error }),
    }
}
