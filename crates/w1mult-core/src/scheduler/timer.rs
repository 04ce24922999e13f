use std::time::Duration;

/// What to do when a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerAction {
    /// Start the next heartbeat.
    Heartbeat,
    /// Thermometer conversions are done; read them.
    ReadThermometers,
    /// A/D conversions are done; read them.
    ReadAdConverters,
}

/// A pending wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timer {
    /// Time the timer expires.
    pub wake: Duration,
    /// Action to run.
    pub action: TimerAction,
}

/// Timers ordered by wake time.
///
/// Insertion is linear; the list never holds more than one timer per
/// action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerList {
    timers: Vec<Timer>,
}

impl TimerList {
    /// Empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self { timers: Vec::new() }
    }

    /// Inserts `timer` ahead of any timer with the same wake time. A timer
    /// already pending for the same action is replaced.
    pub fn insert(&mut self, timer: Timer) {
        self.cancel(timer.action);
        let at = self
            .timers
            .iter()
            .position(|t| t.wake >= timer.wake)
            .unwrap_or(self.timers.len());
        self.timers.insert(at, timer);
    }

    /// Removes the pending timer for `action`. Returns `true` if there was
    /// one.
    pub fn cancel(&mut self, action: TimerAction) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.action != action);
        self.timers.len() != before
    }

    /// Removes and returns the earliest timer if it has expired at `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<Timer> {
        if self.timers.first().is_some_and(|t| t.wake <= now) {
            Some(self.timers.remove(0))
        } else {
            None
        }
    }

    /// Wake time of the earliest timer.
    #[must_use]
    pub fn next_wake(&self) -> Option<Duration> {
        self.timers.first().map(|t| t.wake)
    }

    /// Drops every timer.
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns `true` when no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Timer, TimerAction, TimerList};
    use std::time::Duration;

    fn timer(ms: u64, action: TimerAction) -> Timer {
        Timer {
            wake: Duration::from_millis(ms),
            action,
        }
    }

    #[test]
    fn timers_come_out_in_wake_order() {
        let mut list = TimerList::new();
        list.insert(timer(750, TimerAction::ReadThermometers));
        list.insert(timer(1000, TimerAction::Heartbeat));
        list.insert(timer(5, TimerAction::ReadAdConverters));
        assert_eq!(list.next_wake(), Some(Duration::from_millis(5)));
        assert!(list.pop_due(Duration::from_millis(4)).is_none());
        let order: Vec<_> = std::iter::from_fn(|| list.pop_due(Duration::from_secs(2)))
            .map(|t| t.action)
            .collect();
        assert_eq!(
            order,
            vec![
                TimerAction::ReadAdConverters,
                TimerAction::ReadThermometers,
                TimerAction::Heartbeat
            ]
        );
    }

    #[test]
    fn equal_wake_times_put_the_newest_first() {
        let mut list = TimerList::new();
        list.insert(timer(10, TimerAction::Heartbeat));
        list.insert(timer(10, TimerAction::ReadThermometers));
        let first = list.pop_due(Duration::from_millis(10)).expect("due");
        assert_eq!(first.action, TimerAction::ReadThermometers);
    }

    #[test]
    fn reinserting_an_action_replaces_it() {
        let mut list = TimerList::new();
        list.insert(timer(10, TimerAction::Heartbeat));
        list.insert(timer(20, TimerAction::Heartbeat));
        assert_eq!(list.len(), 1);
        assert_eq!(list.next_wake(), Some(Duration::from_millis(20)));
    }
}
