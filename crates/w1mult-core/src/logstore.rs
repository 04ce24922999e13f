//! Append-only log store boundary and hysteresis filtering.

use std::collections::BTreeMap;
use std::time::Duration;

use log::debug;
use thiserror::Error;

/// Writable slot of the log store, owned by one device value stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LogSlot(pub u32);

/// Read-only handle to a slot, handed to request callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LogHandle(pub u32);

/// One logged sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LogRecord {
    /// Time the value was sampled.
    pub timestamp: Duration,
    /// Sampled value.
    pub value: i32,
    /// Family-specific qualifier, such as the voltage input.
    pub aux: u32,
}

/// Append failures. Neither is fatal; the sample is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum LogError {
    /// The slot holds as many records as it can.
    #[error("log slot is full")]
    Full,
    /// The store has no room for another record or slot.
    #[error("log store is out of space")]
    OutOfSpace,
}

/// Persistent, append-only record store.
pub trait LogStore {
    /// Allocates a new slot.
    ///
    /// # Errors
    ///
    /// [`LogError::OutOfSpace`] when no slot can be made.
    fn allocate_slot(&mut self) -> Result<LogSlot, LogError>;

    /// Appends a record to `slot`.
    ///
    /// # Errors
    ///
    /// [`LogError::Full`] or [`LogError::OutOfSpace`].
    fn append(&mut self, slot: LogSlot, record: LogRecord) -> Result<(), LogError>;

    /// Read-only handle to `slot`.
    fn read_handle(&self, slot: LogSlot) -> LogHandle;
}

/// In-memory store, optionally bounded per slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    slots: BTreeMap<LogSlot, Vec<LogRecord>>,
    capacity: Option<usize>,
}

impl MemoryLogStore {
    /// Unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose slots hold at most `capacity` records each.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            capacity: Some(capacity),
        }
    }

    /// Records behind a read handle, oldest first.
    #[must_use]
    pub fn records(&self, handle: LogHandle) -> &[LogRecord] {
        self.slots
            .get(&LogSlot(handle.0))
            .map_or(&[], Vec::as_slice)
    }

    /// Number of allocated slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl LogStore for MemoryLogStore {
    fn allocate_slot(&mut self) -> Result<LogSlot, LogError> {
        let next = u32::try_from(self.slots.len()).map_err(|_| LogError::OutOfSpace)?;
        let slot = LogSlot(next);
        self.slots.insert(slot, Vec::new());
        Ok(slot)
    }

    fn append(&mut self, slot: LogSlot, record: LogRecord) -> Result<(), LogError> {
        let records = self.slots.get_mut(&slot).ok_or(LogError::OutOfSpace)?;
        if self.capacity.is_some_and(|cap| records.len() >= cap) {
            return Err(LogError::Full);
        }
        records.push(record);
        Ok(())
    }

    fn read_handle(&self, slot: LogSlot) -> LogHandle {
        LogHandle(slot.0)
    }
}

/// Hysteresis filter for one value stream.
///
/// A value is logged when it falls outside `[low, low + threshold]`. `low`
/// then follows the value down, or trails it by `threshold` going up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Hysteresis {
    /// Change needed before a new value is logged.
    pub threshold: i32,
    low: Option<i32>,
}

impl Hysteresis {
    /// Filter that logs the next value it sees.
    #[must_use]
    pub const fn new(threshold: i32) -> Self {
        Self {
            threshold,
            low: None,
        }
    }

    /// Forgets the window so the next value is logged.
    pub fn rearm(&mut self) {
        self.low = None;
    }

    /// Lower edge of the window, if one is set.
    #[must_use]
    pub const fn low(&self) -> Option<i32> {
        self.low
    }

    /// Returns `true` when `value` should be logged.
    #[must_use]
    pub fn should_log(&self, value: i32) -> bool {
        self.low
            .is_none_or(|low| value < low || value > low.saturating_add(self.threshold))
    }

    /// Moves the window after `value` was logged.
    pub fn record(&mut self, value: i32) {
        self.low = Some(match self.low {
            Some(low) if value < low => value,
            _ => value.saturating_sub(self.threshold),
        });
    }

    /// Logs `value` to `slot` if it passes the filter. A failed append drops
    /// the sample and leaves the window alone. Returns `true` when a record
    /// was written.
    pub fn log<L: LogStore + ?Sized>(
        &mut self,
        store: &mut L,
        slot: LogSlot,
        timestamp: Duration,
        value: i32,
        aux: u32,
    ) -> bool {
        if !self.should_log(value) {
            return false;
        }
        let record = LogRecord {
            timestamp,
            value,
            aux,
        };
        match store.append(slot, record) {
            Ok(()) => {
                self.record(value);
                true
            }
            Err(error) => {
                debug!(target: "w1mult::bus", "sample {value} dropped: {error}");
                false
            }
        }
    }
}
