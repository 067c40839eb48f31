use std::collections::{hash_map::Entry, HashMap};

use crate::metrics_consts::DEDUP_DROPPED;
use crate::types::TelemetryRecord;

/// One surviving record per device id for a single poll batch.
pub type DedupedBatch = HashMap<String, TelemetryRecord>;

/// Collapse a poll batch to one record per key, keeping the record with the
/// strictly greatest timestamp; ties keep the earlier-seen record. A poll can
/// carry several updates for the same device and only the freshest state
/// needs to reach the registry.
pub fn dedup_latest(records: Vec<TelemetryRecord>) -> DedupedBatch {
    let mut deduped: DedupedBatch = HashMap::with_capacity(records.len());
    let mut dropped: u64 = 0;

    for record in records {
        match deduped.entry(record.key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
            Entry::Occupied(mut entry) => {
                dropped += 1;
                if record.timestamp_ms > entry.get().timestamp_ms {
                    entry.insert(record);
                }
            }
        }
    }

    if dropped > 0 {
        metrics::counter!(DEDUP_DROPPED).increment(dropped);
    }

    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset_map::Partition;

    fn record(key: &str, offset: i64, timestamp_ms: i64) -> TelemetryRecord {
        TelemetryRecord {
            partition: Partition::new("device_telemetry".to_string(), 0),
            offset,
            key: key.to_string(),
            timestamp_ms,
            payload: format!("{{\"offset\":{offset}}}").into_bytes(),
        }
    }

    #[test]
    fn latest_timestamp_wins() {
        let batch = vec![record("A", 10, 1000), record("A", 11, 2000), record("B", 5, 1000)];

        let deduped = dedup_latest(batch);

        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped["A"].offset, 11);
        assert_eq!(deduped["A"].timestamp_ms, 2000);
        assert_eq!(deduped["B"].offset, 5);
    }

    #[test]
    fn out_of_order_duplicates_still_keep_latest() {
        let batch = vec![record("A", 11, 2000), record("A", 12, 1000)];

        let deduped = dedup_latest(batch);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped["A"].offset, 11);
    }

    #[test]
    fn timestamp_ties_keep_the_earlier_seen_record() {
        let batch = vec![record("A", 10, 1000), record("A", 11, 1000)];

        let deduped = dedup_latest(batch);

        assert_eq!(deduped["A"].offset, 10);
    }

    #[test]
    fn many_duplicates_collapse_to_one() {
        let batch = (0..20).map(|i| record("A", i, 100 + i)).collect();

        let deduped = dedup_latest(batch);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped["A"].offset, 19);
    }

    #[test]
    fn empty_batch_stays_empty() {
        assert!(dedup_latest(Vec::new()).is_empty());
    }
}
