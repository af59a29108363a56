//! Per-partition offset tracking with strict commit ordering.
//!
//! The consumer engine owns one tracker. Every dispatched record is
//! registered before its worker starts; a record becomes committable only
//! on terminal outcome. The drain yields, per partition, the position just
//! past the longest contiguous prefix of completed records, so no offset is
//! ever committed ahead of an earlier uncommitted one.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Default)]
struct PartitionState {
    /// offset -> reached terminal outcome
    pending: BTreeMap<i64, bool>,
}

#[derive(Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(&mut self, position: &RecordPosition) {
        self.partitions
            .entry((position.topic.clone(), position.partition))
            .or_default()
            .pending
            .insert(position.offset, false);
    }

    /// Mark a dispatched record as terminal. Positions never dispatched are
    /// ignored (a redelivered record raced shutdown).
    pub fn mark_committable(&mut self, position: &RecordPosition) {
        if let Some(state) = self
            .partitions
            .get_mut(&(position.topic.clone(), position.partition))
        {
            if let Some(done) = state.pending.get_mut(&position.offset) {
                *done = true;
            }
        }
    }

    /// Drain contiguous completed prefixes. Returns the next-to-consume
    /// position per partition that advanced since the last drain.
    pub fn drain_committable(&mut self) -> Vec<RecordPosition> {
        let mut ready = Vec::new();

        for ((topic, partition), state) in &mut self.partitions {
            let mut last_done = None;
            while let Some((&offset, &done)) = state.pending.iter().next() {
                if !done {
                    break;
                }
                state.pending.remove(&offset);
                last_done = Some(offset);
            }
            if let Some(offset) = last_done {
                ready.push(RecordPosition {
                    topic: topic.clone(),
                    partition: *partition,
                    offset: offset + 1,
                });
            }
        }

        ready
    }

    /// Records dispatched but not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|s| s.pending.values().filter(|done| !**done).count())
            .sum()
    }
}
