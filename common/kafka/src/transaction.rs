use std::time::Duration;

use rdkafka::{
    error::KafkaError,
    producer::{FutureProducer, Producer},
};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::{
    config::KafkaConfig,
    kafka_producer::{client_config, send_keyed, KafkaProduceError},
};

/// A producer with `transactional.id` set and `init_transactions` already
/// called. Only one transaction can ever be open on it: `begin` consumes the
/// producer and `commit`/`abort` hand it back, so overlapping transactions
/// are unrepresentable rather than merely discouraged.
pub struct TransactionalProducer {
    inner: FutureProducer,
    timeout: Duration,
}

impl TransactionalProducer {
    pub fn from_config(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let mut client_config = client_config(config);
        client_config.set("transactional.id", transactional_id);

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

        api.init_transactions(timeout)?;

        Ok(TransactionalProducer {
            inner: api,
            timeout,
        })
    }

    pub fn begin(self) -> Result<KafkaTransaction, KafkaError> {
        self.inner.begin_transaction()?;
        Ok(KafkaTransaction { producer: self })
    }

    // Expose the inner at the producer level, but not at the transaction level -
    // during a transaction, we want strong control over the operations done, but outside
    // of the transaction, we want to be able to do things like fetch metadata
    pub fn inner(&self) -> &FutureProducer {
        &self.inner
    }
}

pub struct KafkaTransaction {
    producer: TransactionalProducer,
}

impl KafkaTransaction {
    /// Send one keyed message inside the open transaction. `None` payloads
    /// are tombstones, same as the non-transactional path.
    pub async fn send_keyed<T>(
        &self,
        topic: &str,
        key: &str,
        payload: Option<&T>,
    ) -> Result<(i32, i64), KafkaProduceError>
    where
        T: Serialize,
    {
        send_keyed(
            &self.producer.inner,
            topic,
            key,
            payload,
            self.producer.timeout,
        )
        .await
    }

    pub fn commit(self) -> Result<TransactionalProducer, KafkaError> {
        self.producer
            .inner
            .commit_transaction(self.producer.timeout)?;
        Ok(self.producer)
    }

    pub fn abort(self) -> Result<TransactionalProducer, KafkaError> {
        self.producer
            .inner
            .abort_transaction(self.producer.timeout)?;
        Ok(self.producer)
    }
}
