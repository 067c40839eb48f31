use std::collections::HashMap;

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// Next-offset-to-commit per partition, aggregated over one dispatch call.
///
/// Built fresh for every dispatch and merged by the dispatcher after all
/// workers have joined, so no shared mutable state is needed: workers hand
/// their progress back by value and [`advance`](Self::advance) folds it in
/// with a monotonic max. A partition's entry never decreases.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OffsetCommitMap {
    inner: HashMap<Partition, i64>,
}

impl OffsetCommitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `partition` is safe to commit up to (but excluding)
    /// `next_offset`. Lower offsets than already recorded are ignored.
    pub fn advance(&mut self, partition: Partition, next_offset: i64) {
        self.inner
            .entry(partition)
            .and_modify(|existing| {
                if next_offset > *existing {
                    *existing = next_offset;
                }
            })
            .or_insert(next_offset);
    }

    pub fn get(&self, partition: &Partition) -> Option<i64> {
        self.inner.get(partition).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Partition, i64)> {
        self.inner.iter().map(|(partition, next)| (partition, *next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    #[test]
    fn advance_initializes_partition() {
        let mut map = OffsetCommitMap::new();
        map.advance(test_partition(0), 100);

        assert_eq!(map.get(&test_partition(0)), Some(100));
    }

    #[test]
    fn advance_takes_the_max() {
        let mut map = OffsetCommitMap::new();
        map.advance(test_partition(0), 100);
        map.advance(test_partition(0), 150);

        assert_eq!(map.get(&test_partition(0)), Some(150));
    }

    #[test]
    fn advance_never_goes_backwards() {
        let mut map = OffsetCommitMap::new();
        map.advance(test_partition(0), 100);
        map.advance(test_partition(0), 50);

        assert_eq!(map.get(&test_partition(0)), Some(100));
    }

    #[test]
    fn partitions_are_independent() {
        let mut map = OffsetCommitMap::new();
        map.advance(test_partition(0), 100);
        map.advance(test_partition(1), 200);
        map.advance(test_partition(2), 300);

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&test_partition(0)), Some(100));
        assert_eq!(map.get(&test_partition(1)), Some(200));
        assert_eq!(map.get(&test_partition(2)), Some(300));
    }

    #[test]
    fn iter_yields_every_entry() {
        let mut map = OffsetCommitMap::new();
        map.advance(test_partition(0), 7);
        map.advance(test_partition(3), 42);

        let mut entries: Vec<(i32, i64)> = map
            .iter()
            .map(|(partition, next)| (partition.partition_number(), next))
            .collect();
        entries.sort_unstable();
        assert_eq!(entries, vec![(0, 7), (3, 42)]);
    }
}
