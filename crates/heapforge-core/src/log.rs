//! Structured lifecycle logging.
//!
//! Each heap keeps a bounded ring of `LifecycleRecord`s that callers can
//! inspect or drain. Every record is also emitted as a `tracing` event under
//! the `heapforge_core` target, so a subscriber sees the same stream.

use std::collections::VecDeque;

use serde::Serialize;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Heap accounting at the moment a record was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccountingSnapshot {
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub bytes_in_use: usize,
    pub total_size: usize,
}

/// Structured heap lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    /// Monotonic decision/event id, unique per heap.
    pub decision_id: u64,
    /// Correlation id: `core::heap::<symbol>::<decision_id>`.
    pub trace_id: String,
    pub level: LogLevel,
    /// Operation (`allocate`, `deallocate`, `reallocate`, `grow`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `merge`, `double_free_detected`, ...).
    pub event: &'static str,
    /// Arena offset of the block involved.
    pub offset: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Size class of the block involved.
    pub class: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    pub accounting: AccountingSnapshot,
}

/// One event about to be recorded.
#[derive(Debug, Clone)]
pub(crate) struct LogEvent {
    level: LogLevel,
    symbol: &'static str,
    event: &'static str,
    outcome: &'static str,
    offset: Option<usize>,
    size: Option<usize>,
    class: Option<usize>,
    details: String,
}

impl LogEvent {
    pub(crate) fn new(
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            outcome,
            offset: None,
            size: None,
            class: None,
            details: String::new(),
        }
    }

    pub(crate) fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub(crate) fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub(crate) fn class(mut self, class: usize) -> Self {
        self.class = Some(class);
        self
    }

    pub(crate) fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded ring of lifecycle records.
#[derive(Debug, Clone)]
pub struct LifecycleLog {
    records: VecDeque<LifecycleRecord>,
    capacity: usize,
    next_decision_id: u64,
    evicted: u64,
}

impl LifecycleLog {
    /// A log retaining at most `capacity` records. Zero keeps nothing but
    /// still forwards events to `tracing`.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_decision_id: 1,
            evicted: 0,
        }
    }

    pub(crate) fn record(&mut self, event: LogEvent, accounting: AccountingSnapshot) -> u64 {
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        let record = LifecycleRecord {
            decision_id,
            trace_id: format!("core::heap::{}::{:016x}", event.symbol, decision_id),
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            offset: event.offset,
            size: event.size,
            class: event.class,
            outcome: event.outcome,
            details: event.details,
            accounting,
        };
        emit(&record);

        if self.capacity == 0 {
            return decision_id;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.evicted += 1;
        }
        self.records.push_back(record);
        decision_id
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> impl ExactSizeIterator<Item = &LifecycleRecord> + '_ {
        self.records.iter()
    }

    /// Remove and return all retained records.
    pub fn drain(&mut self) -> Vec<LifecycleRecord> {
        self.records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records pushed out of the ring by newer ones.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

macro_rules! emit_at {
    ($macro:ident, $record:ident) => {
        tracing::$macro!(
            target: "heapforge_core",
            decision_id = $record.decision_id,
            trace_id = %$record.trace_id,
            symbol = $record.symbol,
            outcome = $record.outcome,
            offset = ?$record.offset,
            size = ?$record.size,
            class = ?$record.class,
            details = %$record.details,
            "{}",
            $record.event
        )
    };
}

fn emit(record: &LifecycleRecord) {
    match record.level {
        LogLevel::Trace => emit_at!(trace, record),
        LogLevel::Debug => emit_at!(debug, record),
        LogLevel::Info => emit_at!(info, record),
        LogLevel::Warn => emit_at!(warn, record),
        LogLevel::Error => emit_at!(error, record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn event(name: &'static str) -> LogEvent {
        LogEvent::new(LogLevel::Trace, "allocate", name, "ok")
    }

    #[test]
    fn records_carry_trace_and_decision_ids() {
        let mut log = LifecycleLog::new(8);
        log.record(event("alloc").offset(64).size(112), AccountingSnapshot::default());
        log.record(event("split"), AccountingSnapshot::default());
        let records: Vec<_> = log.records().collect();
        assert_eq!(records[0].decision_id, 1);
        assert_eq!(records[1].decision_id, 2);
        assert_eq!(records[0].trace_id, "core::heap::allocate::0000000000000001");
        assert_eq!(records[0].offset, Some(64));
        assert_eq!(records[1].offset, None);
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut log = LifecycleLog::new(2);
        for name in ["a", "b", "c"] {
            log.record(event(name), AccountingSnapshot::default());
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.evicted(), 1);
        let events: Vec<_> = log.records().map(|r| r.event).collect();
        assert_eq!(events, ["b", "c"]);
        assert_eq!(log.drain().len(), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_nothing_but_counts() {
        let mut log = LifecycleLog::new(0);
        assert_eq!(log.record(event("alloc"), AccountingSnapshot::default()), 1);
        assert_eq!(log.record(event("alloc"), AccountingSnapshot::default()), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn records_serialize_with_lowercase_levels() {
        let mut log = LifecycleLog::new(1);
        log.record(
            LogEvent::new(LogLevel::Warn, "deallocate", "double_free_detected", "rejected")
                .details("addr=0x40"),
            AccountingSnapshot::default(),
        );
        let json = serde_json::to_value(log.records().next().unwrap()).unwrap();
        assert_eq!(json["level"], "warn");
        assert_eq!(json["event"], "double_free_detected");
        assert_eq!(json["accounting"]["allocated_blocks"], 0);
    }

    #[test]
    #[traced_test]
    fn records_are_mirrored_to_tracing() {
        let mut log = LifecycleLog::new(4);
        log.record(
            LogEvent::new(LogLevel::Warn, "deallocate", "foreign_pointer_rejected", "rejected"),
            AccountingSnapshot::default(),
        );
        assert!(logs_contain("foreign_pointer_rejected"));
        assert!(logs_contain("core::heap::deallocate::"));
    }
}
