//! Heartbeat gating, timers and sampling queues.
//!
//! The next heartbeat is scheduled only when no [`Reason`] is pending.
//! Family handlers that must wait out a hardware conversion take a
//! [`HeartbeatHold`] and hand it back once their results are read.

/// Sorted timer list.
pub mod timer;
pub use timer::{Timer, TimerAction, TimerList};

/// Per-family sampling buckets.
pub mod queue;
pub use queue::{tick_selects, SamplingQueue, MAX_LOG2_SECONDS, NOT_SAMPLED};

use std::time::Duration;

use log::{debug, trace};

/// Time between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Why the next heartbeat must wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reason {
    /// No bus transport is attached.
    NoBus = 0,
    /// The heartbeat timer is already running.
    HeartbeatTimer = 1,
    /// Thermometers are converting.
    Thermometer = 2,
    /// A/D converters are converting or reconfiguring.
    AdConverter = 3,
}

impl Reason {
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of pending [`Reason`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PendingReasons(u8);

impl PendingReasons {
    /// No reason pending.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns `true` when `reason` is pending.
    #[must_use]
    pub const fn contains(self, reason: Reason) -> bool {
        self.0 & reason.bit() != 0
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    const fn with(self, reason: Reason) -> Self {
        Self(self.0 | reason.bit())
    }

    const fn without(self, reason: Reason) -> Self {
        Self(self.0 & !reason.bit())
    }
}

/// Proof that a reason is pending. Hand it back with
/// [`Scheduler::release`]; it cannot be copied.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped hold keeps the heartbeat disabled"]
pub struct HeartbeatHold {
    reason: Reason,
}

impl HeartbeatHold {
    /// The reason this hold keeps pending.
    #[must_use]
    pub const fn reason(&self) -> Reason {
        self.reason
    }
}

/// Heartbeat state machine and timer list.
#[derive(Debug)]
pub struct Scheduler {
    tick: u32,
    last_heartbeat: Duration,
    pending: PendingReasons,
    timers: TimerList,
    timer_hold: Option<HeartbeatHold>,
    bus_hold: Option<HeartbeatHold>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Scheduler waiting for a bus.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tick: 0,
            last_heartbeat: Duration::ZERO,
            pending: PendingReasons::empty().with(Reason::NoBus),
            timers: TimerList::new(),
            timer_hold: None,
            bus_hold: Some(HeartbeatHold {
                reason: Reason::NoBus,
            }),
        }
    }

    /// Marks `reason` pending.
    pub fn hold(&mut self, reason: Reason) -> HeartbeatHold {
        trace!(target: "w1mult::doall", "heartbeat held for {reason:?}");
        self.pending = self.pending.with(reason);
        HeartbeatHold { reason }
    }

    /// Clears the reason of `hold` and schedules the next heartbeat if
    /// nothing else is pending.
    pub fn release(&mut self, hold: HeartbeatHold) {
        trace!(target: "w1mult::doall", "heartbeat released by {:?}", hold.reason);
        self.pending = self.pending.without(hold.reason);
        self.enable_heartbeat();
    }

    /// Schedules the next heartbeat one interval after the last, unless a
    /// reason is pending.
    pub fn enable_heartbeat(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        let wake = self.last_heartbeat + HEARTBEAT_INTERVAL;
        self.timers.insert(Timer {
            wake,
            action: TimerAction::Heartbeat,
        });
        self.timer_hold = Some(self.hold(Reason::HeartbeatTimer));
        debug!(target: "w1mult::doall", "next heartbeat at {wake:?}");
    }

    /// Starts a heartbeat at `now`. Returns its tick number.
    pub fn begin_heartbeat(&mut self, now: Duration) -> u32 {
        if let Some(hold) = self.timer_hold.take() {
            self.pending = self.pending.without(hold.reason);
        }
        self.timers.cancel(TimerAction::Heartbeat);
        self.last_heartbeat = now;
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);
        tick
    }

    /// The transport vanished: drops every timer and waits for a new one.
    pub fn bus_lost(&mut self) {
        self.timers.clear();
        self.timer_hold = None;
        self.pending = PendingReasons::empty().with(Reason::NoBus);
        self.bus_hold = Some(HeartbeatHold {
            reason: Reason::NoBus,
        });
    }

    /// A bus was scanned: restarts the heartbeat count at tick 0 with
    /// every other reason and timer dropped.
    pub fn bus_ready(&mut self, now: Duration) {
        self.timers.clear();
        self.timer_hold = None;
        self.bus_hold = None;
        self.pending = PendingReasons::empty();
        self.tick = 0;
        self.last_heartbeat = now;
    }

    /// Returns `true` while a bus is attached and scanned.
    #[must_use]
    pub const fn has_bus(&self) -> bool {
        self.bus_hold.is_none()
    }

    /// Schedules `action` at `wake`.
    pub fn insert_timer(&mut self, wake: Duration, action: TimerAction) {
        self.timers.insert(Timer { wake, action });
    }

    /// Removes the earliest timer if it expired at `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<Timer> {
        self.timers.pop_due(now)
    }

    /// When the earliest timer expires.
    #[must_use]
    pub fn next_wake(&self) -> Option<Duration> {
        self.timers.next_wake()
    }

    /// Tick number the next heartbeat will get.
    #[must_use]
    pub const fn tick(&self) -> u32 {
        self.tick
    }

    /// Reasons currently pending.
    #[must_use]
    pub const fn pending(&self) -> PendingReasons {
        self.pending
    }

    /// Pending timers.
    #[must_use]
    pub const fn timers(&self) -> &TimerList {
        &self.timers
    }
}

#[cfg(test)]
mod tests {
    use super::{Reason, Scheduler, TimerAction, HEARTBEAT_INTERVAL};
    use std::time::Duration;

    #[test]
    fn no_heartbeat_without_a_bus() {
        let mut scheduler = Scheduler::new();
        scheduler.enable_heartbeat();
        assert!(scheduler.pending().contains(Reason::NoBus));
        assert_eq!(scheduler.next_wake(), None);
    }

    #[test]
    fn heartbeat_follows_the_last_one_by_an_interval() {
        let mut scheduler = Scheduler::new();
        scheduler.bus_ready(Duration::from_secs(3));
        assert_eq!(scheduler.begin_heartbeat(Duration::from_secs(3)), 0);
        scheduler.enable_heartbeat();
        assert_eq!(
            scheduler.next_wake(),
            Some(Duration::from_secs(3) + HEARTBEAT_INTERVAL)
        );
        assert!(scheduler.pending().contains(Reason::HeartbeatTimer));
    }

    #[test]
    fn a_hold_defers_the_heartbeat_until_released() {
        let mut scheduler = Scheduler::new();
        scheduler.bus_ready(Duration::ZERO);
        scheduler.begin_heartbeat(Duration::ZERO);
        let hold = scheduler.hold(Reason::Thermometer);
        scheduler.insert_timer(Duration::from_millis(750), TimerAction::ReadThermometers);
        scheduler.enable_heartbeat();
        assert_eq!(scheduler.timers().len(), 1);

        let timer = scheduler
            .pop_due(Duration::from_millis(750))
            .expect("conversion timer");
        assert_eq!(timer.action, TimerAction::ReadThermometers);
        scheduler.release(hold);
        assert_eq!(scheduler.next_wake(), Some(HEARTBEAT_INTERVAL));
        assert_eq!(scheduler.tick(), 1);
    }

    #[test]
    fn losing_the_bus_drops_timers() {
        let mut scheduler = Scheduler::new();
        scheduler.bus_ready(Duration::ZERO);
        scheduler.begin_heartbeat(Duration::ZERO);
        scheduler.enable_heartbeat();
        scheduler.bus_lost();
        assert!(!scheduler.has_bus());
        assert!(scheduler.timers().is_empty());
        assert!(scheduler.pending().contains(Reason::NoBus));
    }
}
