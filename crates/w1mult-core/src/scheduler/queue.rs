use std::collections::BTreeSet;

use crate::topology::DeviceId;

/// Longest sampling period, as a power of two of heartbeat ticks.
pub const MAX_LOG2_SECONDS: u8 = 7;

/// Period value meaning "do not sample".
pub const NOT_SAMPLED: u8 = u8::MAX;

/// Devices of one family grouped by sampling period.
///
/// Bucket `k` holds the devices sampled every `2^k` ticks. A device is in at
/// most one bucket of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplingQueue {
    buckets: [BTreeSet<DeviceId>; MAX_LOG2_SECONDS as usize + 1],
}

/// Returns `true` when a device sampled every `2^log2` ticks is due at
/// `tick`.
#[must_use]
pub const fn tick_selects(tick: u32, log2: u8) -> bool {
    let log2 = if log2 > MAX_LOG2_SECONDS {
        MAX_LOG2_SECONDS
    } else {
        log2
    };
    tick & ((1u32 << log2) - 1) == 0
}

impl SamplingQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `id` to the bucket for `log2`, clamped to
    /// [`MAX_LOG2_SECONDS`]. [`NOT_SAMPLED`] removes it.
    pub fn place(&mut self, id: DeviceId, log2: u8) {
        self.remove(id);
        if log2 != NOT_SAMPLED {
            self.buckets[usize::from(log2.min(MAX_LOG2_SECONDS))].insert(id);
        }
    }

    /// Removes `id` from whichever bucket holds it.
    pub fn remove(&mut self, id: DeviceId) {
        for bucket in &mut self.buckets {
            bucket.remove(&id);
        }
    }

    /// Bucket holding `id`, if any.
    #[must_use]
    pub fn bucket_of(&self, id: DeviceId) -> Option<u8> {
        (0..=MAX_LOG2_SECONDS).find(|&k| self.buckets[usize::from(k)].contains(&id))
    }

    /// Devices due at `tick`, in id order.
    #[must_use]
    pub fn due(&self, tick: u32) -> Vec<DeviceId> {
        let mut due = Vec::new();
        for log2 in 0..=MAX_LOG2_SECONDS {
            if tick_selects(tick, log2) {
                due.extend(self.buckets[usize::from(log2)].iter().copied());
            }
        }
        due.sort_unstable();
        due
    }

    /// Returns `true` when no device is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(BTreeSet::is_empty)
    }
}
