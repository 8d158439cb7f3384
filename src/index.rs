//! Where records live and which record holds a given event.

use serde::Serialize;

/// One record's location, in occurrence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RecordPosition {
    /// File or buffer offset of the record header
    pub position: u64,
    /// Record length in bytes (as stored)
    pub length: u32,
    /// Events in the record
    pub count: u32,
}

impl RecordPosition {
    pub fn new(position: u64, length: u32, count: u32) -> Self {
        Self {
            position,
            length,
            count,
        }
    }
}

/// Maps a global event ordinal onto (record, event within record).
///
/// Built from per-record event counts; lookups binary search the
/// cumulative totals. The index also tracks a current event so callers can
/// step forwards and backwards and learn when a step crosses into another
/// record.
#[derive(Clone, Debug, Default)]
pub struct FileEventIndex {
    cumulative: Vec<usize>,
    current: usize,
    current_record: usize,
}

impl FileEventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.cumulative.clear();
        self.current = 0;
        self.current_record = 0;
    }

    /// Append the next record's event count.
    pub fn add_event_size(&mut self, count: u32) {
        let total = self.max_events() + count as usize;
        self.cumulative.push(total);
    }

    pub fn max_events(&self) -> usize {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn record_count(&self) -> usize {
        self.cumulative.len()
    }

    /// Events in records before `record`.
    pub fn first_event_of(&self, record: usize) -> usize {
        if record == 0 {
            0
        } else {
            self.cumulative.get(record - 1).copied().unwrap_or_else(|| self.max_events())
        }
    }

    /// (record, event within record) of global event `index`.
    pub fn locate(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.max_events() {
            return None;
        }
        let record = self.cumulative.partition_point(|&c| c <= index);
        Some((record, index - self.first_event_of(record)))
    }

    /// Make `index` current. Returns true when it lives in a different
    /// record than the previous current event.
    pub fn set_event(&mut self, index: usize) -> bool {
        match self.locate(index) {
            Some((record, _)) => {
                let changed = record != self.current_record;
                self.current = index;
                self.current_record = record;
                changed
            }
            None => false,
        }
    }

    pub fn can_advance(&self) -> bool {
        self.current + 1 < self.max_events()
    }

    /// Step to the next event, returning true if that crosses a record.
    pub fn advance(&mut self) -> bool {
        if !self.can_advance() {
            return false;
        }
        self.set_event(self.current + 1)
    }

    pub fn can_retreat(&self) -> bool {
        self.current > 0 && self.max_events() > 0
    }

    /// Step to the previous event, returning true if that crosses a record.
    pub fn retreat(&mut self) -> bool {
        if !self.can_retreat() {
            return false;
        }
        self.set_event(self.current - 1)
    }

    pub fn event_number(&self) -> usize {
        self.current
    }

    pub fn record_number(&self) -> usize {
        self.current_record
    }
}
