use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, MessageStream, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use common_kafka::config::{ConsumerConfig, KafkaConfig};

use crate::config::Config;
use crate::dedup::dedup_latest;
use crate::dispatch::PatchDispatcher;
use crate::metrics_consts::{
    BATCHES_FAILED, CONSUMER_ERRORS, CONSUMER_SESSIONS, OFFSET_COMMITS, OFFSET_COMMIT_FAILURES,
    RECORDS_PER_POLL, RECORDS_SKIPPED,
};
use crate::offset_map::{OffsetCommitMap, Partition};
use crate::registry::DeviceRegistry;
use crate::types::TelemetryRecord;

/// Consumer context that keeps the locally tracked partition set in step
/// with the broker's assignment: cleared on revoke, repopulated on assign.
/// No offsets are held across a resubscribe; the committed offsets in the
/// broker are the only source of truth after a rebalance.
pub struct TelemetryConsumerContext {
    assigned: Arc<Mutex<HashSet<Partition>>>,
}

impl rdkafka::ClientContext for TelemetryConsumerContext {}

impl ConsumerContext for TelemetryConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!("partitions revoked: {}", partitions.count());
            self.assigned
                .lock()
                .expect("partition set lock poisoned")
                .clear();
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            let mut assigned = self.assigned.lock().expect("partition set lock poisoned");
            assigned.clear();
            for elem in partitions.elements() {
                assigned.insert(Partition::from(elem));
            }
            info!("partitions assigned: {}", assigned.len());
        }
    }
}

/// Owns the poll-dedup-dispatch-commit cycle for the telemetry topic.
///
/// One cycle runs at a time: the dispatch call is awaited inline and the
/// commit is synchronous, so offsets only ever reflect fully-processed
/// batches. If a dispatch fails (some record exhausted its retries on a
/// transient error) nothing is committed and the client is recreated, which
/// re-polls the same offsets: at-least-once delivery, with the whole batch
/// redelivered. That is safe because application is idempotent per key.
pub struct TelemetryConsumer<R> {
    kafka: KafkaConfig,
    consumer: ConsumerConfig,
    max_poll_records: usize,
    poll_timeout: Duration,
    dispatcher: PatchDispatcher<R>,
    assigned: Arc<Mutex<HashSet<Partition>>>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl<R: DeviceRegistry> TelemetryConsumer<R> {
    pub fn new(
        config: &Config,
        dispatcher: PatchDispatcher<R>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            kafka: config.kafka.clone(),
            consumer: config.consumer.clone(),
            max_poll_records: config.max_poll_records,
            poll_timeout: config.poll_timeout(),
            dispatcher,
            assigned: Arc::new(Mutex::new(HashSet::new())),
            shutdown_rx,
        }
    }

    fn connect(&self) -> Result<StreamConsumer<TelemetryConsumerContext>, KafkaError> {
        let context = TelemetryConsumerContext {
            assigned: self.assigned.clone(),
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &self.consumer.kafka_consumer_group)
            .set("auto.offset.reset", &self.consumer.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if self.kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer<TelemetryConsumerContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[self.consumer.kafka_consumer_topic.as_str()])?;

        Ok(consumer)
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            topic = self.consumer.kafka_consumer_topic,
            group = self.consumer.kafka_consumer_group,
            "starting telemetry consumption"
        );

        'session: loop {
            metrics::counter!(CONSUMER_SESSIONS).increment(1);
            let consumer = match self.connect() {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("failed to create kafka consumer: {e}");
                    sleep(Duration::from_secs(1)).await;
                    continue 'session;
                }
            };
            let mut stream = consumer.stream();

            loop {
                tokio::select! {
                    _ = &mut self.shutdown_rx => {
                        info!("shutdown signal received, stopping consumption");
                        break 'session;
                    }

                    polled = Self::poll_batch(&mut stream, self.max_poll_records, self.poll_timeout) => {
                        let records = match polled {
                            Ok(records) => records,
                            Err(e) => {
                                error!("fatal kafka error, recreating consumer: {e}");
                                sleep(Duration::from_secs(1)).await;
                                continue 'session;
                            }
                        };
                        if records.is_empty() {
                            continue;
                        }
                        metrics::histogram!(RECORDS_PER_POLL).record(records.len() as f64);

                        let deduped = dedup_latest(records);
                        match self.dispatcher.dispatch(deduped).await {
                            Ok(offsets) => {
                                if let Err(e) = self.commit(&consumer, &offsets) {
                                    error!("offset commit failed, recreating consumer: {e}");
                                    metrics::counter!(OFFSET_COMMIT_FAILURES).increment(1);
                                    continue 'session;
                                }
                            }
                            Err(e) => {
                                // Nothing from this poll is committed, successes
                                // included; the recreated client re-polls the
                                // batch and the registry sees the updates again.
                                metrics::counter!(BATCHES_FAILED).increment(1);
                                error!("dispatch failed, batch will be redelivered: {e}");
                                continue 'session;
                            }
                        }
                    }
                }
            }
        }

        info!("telemetry consumer stopped");
        Ok(())
    }

    /// Collect up to `max_records` telemetry records, or as many as arrive
    /// within `timeout`. Keyless and payloadless messages are counted and
    /// skipped; transient driver errors are handled in place and only fatal
    /// ones bubble up.
    async fn poll_batch(
        stream: &mut MessageStream<'_, TelemetryConsumerContext>,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<TelemetryRecord>, KafkaError> {
        let mut records = Vec::with_capacity(max_records);
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut error_streak: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut deadline => break,

                next = stream.next() => {
                    match next {
                        Some(Ok(message)) => {
                            error_streak = 0;
                            match TelemetryRecord::from_borrowed_message(&message) {
                                Ok(record) => records.push(record),
                                Err(defect) => {
                                    metrics::counter!(RECORDS_SKIPPED, "reason" => defect.as_str())
                                        .increment(1);
                                    debug!("skipping undispatchable record: {}", defect.as_str());
                                }
                            }
                            if records.len() >= max_records {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error_streak += 1;
                            if let Some(fatal) = handle_kafka_error(e, error_streak).await {
                                return Err(fatal);
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(records)
    }

    /// Commit the dispatch outcome synchronously. Partitions revoked while
    /// the dispatch was running are skipped: their new owner resumes from the
    /// last committed offset and reprocesses what we couldn't commit.
    fn commit(
        &self,
        consumer: &StreamConsumer<TelemetryConsumerContext>,
        offsets: &OffsetCommitMap,
    ) -> Result<(), KafkaError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let assigned = self
            .assigned
            .lock()
            .expect("partition set lock poisoned")
            .clone();

        let mut list = rdkafka::TopicPartitionList::new();
        for (partition, next_offset) in offsets.iter() {
            if !assigned.contains(partition) {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "not committing offset for partition revoked mid-dispatch"
                );
                continue;
            }
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                rdkafka::Offset::Offset(next_offset),
            )?;
        }

        if list.count() == 0 {
            return Ok(());
        }

        consumer.commit(&list, CommitMode::Sync)?;
        metrics::counter!(OFFSET_COMMITS).increment(1);
        debug!("committed offsets for {} partitions", list.count());
        Ok(())
    }
}

/// Triage a consumer error: transient conditions are logged, counted, and
/// waited out in place; anything fatal is returned so the caller can tear
/// the client down.
async fn handle_kafka_error(e: KafkaError, streak: u64) -> Option<KafkaError> {
    match &e {
        KafkaError::MessageConsumption(code) => {
            match code {
                RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut => {
                    metrics::counter!(CONSUMER_ERRORS, "error" => "transient").increment(1);
                }
                RDKafkaErrorCode::OffsetOutOfRange => {
                    // auto.offset.reset seeks for us in coordination with the broker
                    warn!("offset out of range, waiting for offset reset");
                    metrics::counter!(CONSUMER_ERRORS, "error" => "offset_out_of_range")
                        .increment(1);
                    sleep(Duration::from_millis(500)).await;
                }
                _ => {
                    warn!("kafka consumer error: {code:?}");
                    metrics::counter!(CONSUMER_ERRORS, "error" => "consumer").increment(1);
                    sleep(Duration::from_millis(100 * streak.min(10))).await;
                }
            }
            None
        }

        KafkaError::MessageConsumptionFatal(code) => {
            error!("fatal kafka consumer error: {code:?}");
            metrics::counter!(CONSUMER_ERRORS, "error" => "fatal").increment(1);
            Some(e)
        }

        KafkaError::Global(code) => {
            match code {
                RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                    warn!("broker connectivity lost: {code:?}, waiting for reconnect");
                    metrics::counter!(CONSUMER_ERRORS, "error" => "broker_down").increment(1);
                    sleep(Duration::from_secs(streak.min(5))).await;
                    None
                }
                RDKafkaErrorCode::Authentication => {
                    error!("kafka authentication failed: {code:?}");
                    metrics::counter!(CONSUMER_ERRORS, "error" => "authentication").increment(1);
                    Some(e)
                }
                _ => {
                    warn!("kafka error: {code:?}");
                    metrics::counter!(CONSUMER_ERRORS, "error" => "global").increment(1);
                    sleep(Duration::from_millis(500 * streak.min(6))).await;
                    None
                }
            }
        }

        KafkaError::Canceled => {
            info!("consumer canceled, shutting down");
            Some(e)
        }

        _ => {
            warn!("unexpected kafka error: {e:?}");
            metrics::counter!(CONSUMER_ERRORS, "error" => "unexpected").increment(1);
            sleep(Duration::from_millis(100 * streak.min(10))).await;
            None
        }
    }
}
