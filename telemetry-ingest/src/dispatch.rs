use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::dead_letter::DeadLetterSink;
use crate::dedup::DedupedBatch;
use crate::metrics_consts::{ACTIVE_WORKERS, BATCHES_DISPATCHED, PATCH_NON_RETRIABLE};
use crate::offset_map::{OffsetCommitMap, Partition};
use crate::registry::{apply_telemetry, DeviceRegistry};
use crate::retry::{PatchError, RetryPolicy};
use crate::types::{TelemetryPayload, TelemetryRecord};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("retries exhausted applying telemetry for device {device_id}: {source}")]
    RetriesExhausted {
        device_id: String,
        #[source]
        source: PatchError,
    },
    #[error("patch worker panicked: {0}")]
    WorkerPanicked(#[from] tokio::task::JoinError),
}

/// Applies a deduplicated batch with bounded parallelism and produces the
/// offsets that are safe to commit afterwards.
///
/// Workers run on a semaphore-bounded pool shared across all dispatch calls;
/// each returns its partition progress by value and the dispatcher folds the
/// results into a fresh [`OffsetCommitMap`] after every task has joined. A
/// dispatch therefore never returns a partial view: the map reflects every
/// record's outcome, and any exhausted-retriable failure fails the whole call
/// (only after the join), forcing redelivery of the batch.
pub struct PatchDispatcher<R> {
    registry: Arc<R>,
    dead_letter: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl<R: DeviceRegistry> PatchDispatcher<R> {
    pub fn new(
        registry: Arc<R>,
        dead_letter: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
        worker_count: usize,
    ) -> Self {
        Self {
            registry,
            dead_letter,
            retry,
            permits: Arc::new(Semaphore::new(worker_count.max(1))),
        }
    }

    pub async fn dispatch(&self, batch: DedupedBatch) -> Result<OffsetCommitMap, DispatchError> {
        metrics::counter!(BATCHES_DISPATCHED).increment(1);

        let mut tasks: JoinSet<Result<(Partition, i64), DispatchError>> = JoinSet::new();
        for (device_id, record) in batch {
            let registry = self.registry.clone();
            let dead_letter = self.dead_letter.clone();
            let retry = self.retry;
            let permits = self.permits.clone();

            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("patch worker semaphore closed");
                metrics::gauge!(ACTIVE_WORKERS).increment(1.0);
                let result =
                    process_record(registry.as_ref(), &*dead_letter, retry, &device_id, record)
                        .await;
                metrics::gauge!(ACTIVE_WORKERS).decrement(1.0);
                result
            });
        }

        // Join barrier: drain every task before deciding the call's outcome,
        // so the offset map reflects all workers and a failed batch doesn't
        // leave workers running into the next poll cycle.
        let mut offsets = OffsetCommitMap::new();
        let mut failure: Option<DispatchError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((partition, next_offset))) => offsets.advance(partition, next_offset),
                Ok(Err(e)) => {
                    error!("patch worker failed: {e}");
                    failure.get_or_insert(e);
                }
                Err(join_error) => {
                    error!("patch worker panicked: {join_error}");
                    failure.get_or_insert(DispatchError::WorkerPanicked(join_error));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(offsets),
        }
    }
}

/// Process one record to a terminal outcome and report how far its partition
/// may advance.
///
/// Success commits past the record (`offset + 1`). A non-retriable failure
/// dead-letters the record and advances only to `offset`: everything before
/// the poison record is committed past, while the record itself may be seen
/// once more after a restart and will dead-letter again harmlessly. An
/// exhausted retriable failure is handed back to the dispatcher to fail the
/// whole batch.
async fn process_record<R: DeviceRegistry>(
    registry: &R,
    dead_letter: &dyn DeadLetterSink,
    retry: RetryPolicy,
    device_id: &str,
    record: TelemetryRecord,
) -> Result<(Partition, i64), DispatchError> {
    let candidate_offset = record.offset + 1;

    let applied = match serde_json::from_slice::<TelemetryPayload>(&record.payload) {
        Ok(payload) => {
            let reported_at = record.reported_at();
            retry
                .run(payload.device_type(), || {
                    apply_telemetry(registry, device_id, &payload, reported_at)
                })
                .await
        }
        Err(e) => {
            metrics::counter!(
                PATCH_NON_RETRIABLE,
                "device_type" => "unknown",
                "error" => "malformed_payload"
            )
            .increment(1);
            Err(PatchError::Malformed(e))
        }
    };

    match applied {
        Ok(_outcome) => Ok((record.partition, candidate_offset)),
        Err(e) if e.is_retriable() => Err(DispatchError::RetriesExhausted {
            device_id: device_id.to_string(),
            source: e,
        }),
        Err(e) => {
            warn!(device_id, "dead-lettering record after non-retriable failure: {e}");
            dead_letter
                .send(String::from_utf8_lossy(&record.payload).into_owned())
                .await;
            Ok((record.partition, record.offset))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::types::{
        DoorSensorTelemetry, EnergyMeterTelemetry, SmartLightTelemetry, SmartPlugTelemetry,
        SoilMoistureTelemetry, TemperatureTelemetry, ThermostatTelemetry,
    };

    #[derive(Clone, Copy)]
    enum Scripted {
        Rows(u64),
        Transient,
        Fatal,
    }

    impl Scripted {
        fn into_result(self) -> Result<u64, sqlx::Error> {
            match self {
                Scripted::Rows(n) => Ok(n),
                Scripted::Transient => Err(sqlx::Error::PoolTimedOut),
                Scripted::Fatal => Err(sqlx::Error::RowNotFound),
            }
        }
    }

    /// Registry double: pops a scripted outcome per call, per device id;
    /// devices without a script always succeed with one row.
    #[derive(Default)]
    struct ScriptedRegistry {
        script: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: AtomicU32,
    }

    impl ScriptedRegistry {
        fn with_script(device_id: &str, outcomes: Vec<Scripted>) -> Self {
            let registry = Self::default();
            registry
                .script
                .lock()
                .unwrap()
                .insert(device_id.to_string(), outcomes.into());
            registry
        }

        fn next(&self, device_id: &str) -> Result<u64, sqlx::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(device_id)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Scripted::Rows(1));
            scripted.into_result()
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceRegistry for ScriptedRegistry {
        async fn patch_door_sensor(
            &self,
            device_id: &str,
            _telemetry: &DoorSensorTelemetry,
            _reported_at: Option<DateTime<Utc>>,
        ) -> Result<u64, sqlx::Error> {
            self.next(device_id)
        }

        async fn patch_energy_meter(
            &self,
            device_id: &str,
            _telemetry: &EnergyMeterTelemetry,
            _reported_at: Option<DateTime<Utc>>,
        ) -> Result<u64, sqlx::Error> {
            self.next(device_id)
        }

        async fn patch_smart_light(
            &self,
            device_id: &str,
            _telemetry: &SmartLightTelemetry,
            _reported_at: Option<DateTime<Utc>>,
        ) -> Result<u64, sqlx::Error> {
            self.next(device_id)
        }

        async fn patch_smart_plug(
            &self,
            device_id: &str,
            _telemetry: &SmartPlugTelemetry,
            _reported_at: Option<DateTime<Utc>>,
        ) -> Result<u64, sqlx::Error> {
            self.next(device_id)
        }

        async fn patch_soil_moisture_sensor(
            &self,
            device_id: &str,
            _telemetry: &SoilMoistureTelemetry,
            _reported_at: Option<DateTime<Utc>>,
        ) -> Result<u64, sqlx::Error> {
            self.next(device_id)
        }

        async fn patch_temperature_sensor(
            &self,
            device_id: &str,
            _telemetry: &TemperatureTelemetry,
            _reported_at: Option<DateTime<Utc>>,
        ) -> Result<u64, sqlx::Error> {
            self.next(device_id)
        }

        async fn patch_thermostat(
            &self,
            device_id: &str,
            _telemetry: &ThermostatTelemetry,
            _reported_at: Option<DateTime<Utc>>,
        ) -> Result<u64, sqlx::Error> {
            self.next(device_id)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        values: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.values.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn send(&self, value: String) {
            self.values.lock().unwrap().push(value);
        }
    }

    fn telemetry_json() -> Vec<u8> {
        serde_json::to_vec(&TelemetryPayload::SmartPlug(SmartPlugTelemetry {
            on: true,
            power_w: 12.5,
        }))
        .unwrap()
    }

    fn record(key: &str, partition: i32, offset: i64) -> (String, TelemetryRecord) {
        (
            key.to_string(),
            TelemetryRecord {
                partition: Partition::new("device_telemetry".to_string(), partition),
                offset,
                key: key.to_string(),
                timestamp_ms: 1_700_000_000_000 + offset,
                payload: telemetry_json(),
            },
        )
    }

    fn dispatcher(
        registry: ScriptedRegistry,
        sink: Arc<RecordingSink>,
        max_attempts: u32,
    ) -> PatchDispatcher<ScriptedRegistry> {
        PatchDispatcher::new(
            Arc::new(registry),
            sink,
            RetryPolicy::new(max_attempts, Duration::from_millis(1)),
            4,
        )
    }

    fn partition(num: i32) -> Partition {
        Partition::new("device_telemetry".to_string(), num)
    }

    #[tokio::test]
    async fn successful_batch_advances_every_partition_past_its_records() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(ScriptedRegistry::default(), sink.clone(), 3);

        let batch: DedupedBatch = [record("A", 0, 41), record("B", 1, 7)].into();
        let offsets = dispatcher.dispatch(batch).await.unwrap();

        assert_eq!(offsets.get(&partition(0)), Some(42));
        assert_eq!(offsets.get(&partition(1)), Some(8));
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn same_partition_records_merge_to_the_max_offset() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(ScriptedRegistry::default(), sink, 3);

        let batch: DedupedBatch = [record("A", 0, 10), record("B", 0, 25), record("C", 0, 3)].into();
        let offsets = dispatcher.dispatch(batch).await.unwrap();

        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets.get(&partition(0)), Some(26));
    }

    #[tokio::test]
    async fn fatal_record_is_dead_lettered_and_advances_to_its_own_offset() {
        let sink = Arc::new(RecordingSink::default());
        let registry = ScriptedRegistry::with_script("D", vec![Scripted::Fatal]);
        let dispatcher = dispatcher(registry, sink.clone(), 3);

        let batch: DedupedBatch = [record("D", 0, 17)].into();
        let offsets = dispatcher.dispatch(batch).await.unwrap();

        // Committed past everything before the poison record, not past it.
        assert_eq!(offsets.get(&partition(0)), Some(17));
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn fatal_record_takes_exactly_one_attempt() {
        let sink = Arc::new(RecordingSink::default());
        let registry = ScriptedRegistry::with_script("D", vec![Scripted::Fatal]);
        let dispatcher = dispatcher(registry, sink.clone(), 3);

        let batch: DedupedBatch = [record("D", 0, 17)].into();
        dispatcher.dispatch(batch).await.unwrap();

        assert_eq!(dispatcher.registry.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retriable_fails_the_whole_dispatch() {
        let sink = Arc::new(RecordingSink::default());
        let registry =
            ScriptedRegistry::with_script("A", vec![Scripted::Transient, Scripted::Transient]);
        let dispatcher = dispatcher(registry, sink.clone(), 2);

        let batch: DedupedBatch = [record("A", 0, 10), record("B", 1, 20)].into();
        let result = dispatcher.dispatch(batch).await;

        match result {
            Err(DispatchError::RetriesExhausted { device_id, source }) => {
                assert_eq!(device_id, "A");
                assert!(source.is_retriable());
            }
            other => panic!("expected retries-exhausted failure, got {other:?}"),
        }
        // Nothing was dead-lettered, and the join barrier means B still ran:
        // two attempts for A plus one for B.
        assert_eq!(sink.count(), 0);
        assert_eq!(dispatcher.registry.call_count(), 3);
    }

    #[tokio::test]
    async fn transient_then_success_still_commits_past_the_record() {
        let sink = Arc::new(RecordingSink::default());
        let registry = ScriptedRegistry::with_script(
            "C",
            vec![Scripted::Transient, Scripted::Transient, Scripted::Rows(1)],
        );
        let dispatcher = dispatcher(registry, sink.clone(), 3);

        let batch: DedupedBatch = [record("C", 2, 99)].into();
        let offsets = dispatcher.dispatch(batch).await.unwrap();

        assert_eq!(offsets.get(&partition(2)), Some(100));
        assert_eq!(dispatcher.registry.call_count(), 3);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_dead_letters_without_touching_the_registry() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(ScriptedRegistry::default(), sink.clone(), 3);

        let (key, mut bad) = record("E", 0, 30);
        bad.payload = b"{\"type\":\"unknown_gadget\"}".to_vec();
        let batch: DedupedBatch = [(key, bad)].into();

        let offsets = dispatcher.dispatch(batch).await.unwrap();

        assert_eq!(offsets.get(&partition(0)), Some(30));
        assert_eq!(sink.count(), 1);
        assert_eq!(dispatcher.registry.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_batch_returns_an_empty_map() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(ScriptedRegistry::default(), sink, 3);

        let offsets = dispatcher.dispatch(DedupedBatch::new()).await.unwrap();
        assert!(offsets.is_empty());
    }
}
