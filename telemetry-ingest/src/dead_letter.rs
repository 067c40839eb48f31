use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::error;

use crate::metrics_consts::{DEAD_LETTER_RECORDS, DEAD_LETTER_SEND_FAILURES};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Side channel for records the pipeline has given up on. The pipeline has
/// already decided to move past the record when it calls `send`, so the sink
/// absorbs its own failures: they are logged and counted, never returned.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn send(&self, value: String);
}

/// Publishes dead letters to a dedicated topic for out-of-band inspection.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, value: String) {
        let record = FutureRecord::<(), String>::to(&self.topic).payload(&value);

        match self.producer.send(record, Timeout::After(SEND_TIMEOUT)).await {
            Ok(_) => {
                metrics::counter!(DEAD_LETTER_RECORDS).increment(1);
            }
            Err((e, _)) => {
                metrics::counter!(DEAD_LETTER_SEND_FAILURES).increment(1);
                error!("failed to publish dead letter to {}: {e}", self.topic);
            }
        }
    }
}
