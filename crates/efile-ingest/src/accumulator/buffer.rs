//! Per-record-type buffer of payloads awaiting a bulk write

use efile_common::types::RecordPayload;

#[derive(Debug)]
pub struct RecordBuffer {
    records: Vec<RecordPayload>,
    threshold: usize,
}

impl RecordBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            records: Vec::new(),
            threshold: threshold.max(1),
        }
    }

    /// Append a payload; returns true once the threshold is reached
    pub fn push(&mut self, payload: RecordPayload) -> bool {
        self.records.push(payload);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Swap the contents out for a fresh empty buffer
    pub fn take(&mut self) -> Vec<RecordPayload> {
        std::mem::take(&mut self.records)
    }

    /// Put a taken snapshot back in front of anything appended since
    pub fn restore(&mut self, mut snapshot: Vec<RecordPayload>) {
        snapshot.append(&mut self.records);
        self.records = snapshot;
    }
}
