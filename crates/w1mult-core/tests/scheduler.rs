//! Heartbeat gating, timer ordering and sampling periods.

use std::time::Duration;

use log as _;
use proptest::prelude::*;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use w1mult_core::scheduler::{tick_selects, TimerList, NOT_SAMPLED};
use w1mult_core::{
    DeviceId, Reason, SamplingQueue, Scheduler, Timer, TimerAction, HEARTBEAT_INTERVAL,
    MAX_LOG2_SECONDS,
};

proptest! {
    #[test]
    fn device_is_due_once_per_period(log2 in 0u8..=MAX_LOG2_SECONDS, tick in any::<u32>()) {
        let mut queue = SamplingQueue::new();
        queue.place(DeviceId(3), log2);
        let period = 1u32 << log2;
        prop_assert_eq!(queue.due(tick).contains(&DeviceId(3)), tick % period == 0);
    }

    #[test]
    fn long_periods_are_clamped(log2 in MAX_LOG2_SECONDS..NOT_SAMPLED, tick in any::<u32>()) {
        prop_assert_eq!(tick_selects(tick, log2), tick_selects(tick, MAX_LOG2_SECONDS));
    }

    #[test]
    fn due_devices_come_in_id_order(
        periods in prop::collection::vec(0u8..=MAX_LOG2_SECONDS, 1..20),
        tick in any::<u32>()
    ) {
        let mut queue = SamplingQueue::new();
        for (index, &log2) in periods.iter().enumerate() {
            queue.place(DeviceId(index), log2);
        }
        let due = queue.due(tick);
        prop_assert!(due.windows(2).all(|pair| pair[0] < pair[1]));
        let expected = periods
            .iter()
            .filter(|&&log2| tick_selects(tick, log2))
            .count();
        prop_assert_eq!(due.len(), expected);
    }

    #[test]
    fn timers_pop_in_wake_order(wakes in prop::collection::vec(0u64..10_000, 1..3)) {
        let actions = [
            TimerAction::Heartbeat,
            TimerAction::ReadThermometers,
            TimerAction::ReadAdConverters,
        ];
        let mut timers = TimerList::new();
        for (&millis, &action) in wakes.iter().zip(&actions) {
            timers.insert(Timer { wake: Duration::from_millis(millis), action });
        }
        let mut last = Duration::ZERO;
        while let Some(timer) = timers.pop_due(Duration::MAX) {
            prop_assert!(timer.wake >= last);
            last = timer.wake;
        }
        prop_assert!(timers.is_empty());
    }
}

#[rstest]
#[case(0, &[0, 1, 2, 3, 4])]
#[case(1, &[0, 2, 4])]
#[case(2, &[0, 4])]
fn period_selects_ticks(#[case] log2: u8, #[case] ticks: &[u32]) {
    let selected: Vec<u32> = (0..5).filter(|&tick| tick_selects(tick, log2)).collect();
    assert_eq!(selected, ticks);
}

#[test]
fn reconfiguring_moves_a_device_between_buckets() {
    let mut queue = SamplingQueue::new();
    queue.place(DeviceId(1), 0);
    queue.place(DeviceId(1), 3);
    assert_eq!(queue.bucket_of(DeviceId(1)), Some(3));
    assert!(!queue.due(1).contains(&DeviceId(1)));
    queue.place(DeviceId(1), NOT_SAMPLED);
    assert!(queue.is_empty());
}

#[test]
fn same_action_replaces_the_pending_timer() {
    let mut timers = TimerList::new();
    timers.insert(Timer {
        wake: Duration::from_millis(750),
        action: TimerAction::ReadThermometers,
    });
    timers.insert(Timer {
        wake: Duration::from_millis(94),
        action: TimerAction::ReadThermometers,
    });
    assert_eq!(timers.len(), 1);
    assert_eq!(timers.next_wake(), Some(Duration::from_millis(94)));
}

#[test]
fn heartbeat_waits_for_every_hold() {
    let mut scheduler = Scheduler::new();
    scheduler.bus_ready(Duration::ZERO);
    assert_eq!(scheduler.begin_heartbeat(Duration::ZERO), 0);
    let thermometers = scheduler.hold(Reason::Thermometer);
    let converters = scheduler.hold(Reason::AdConverter);
    scheduler.enable_heartbeat();
    assert_eq!(scheduler.next_wake(), None);

    scheduler.release(converters);
    assert_eq!(scheduler.next_wake(), None);
    assert!(scheduler.pending().contains(Reason::Thermometer));

    scheduler.release(thermometers);
    assert_eq!(scheduler.next_wake(), Some(HEARTBEAT_INTERVAL));
    let timer = scheduler.pop_due(HEARTBEAT_INTERVAL).expect("heartbeat due");
    assert_eq!(timer.action, TimerAction::Heartbeat);
    assert_eq!(scheduler.begin_heartbeat(timer.wake), 1);
}

#[test]
fn late_heartbeat_keeps_the_interval_from_when_it_ran() {
    let mut scheduler = Scheduler::new();
    scheduler.bus_ready(Duration::ZERO);
    scheduler.begin_heartbeat(Duration::from_millis(1_300));
    scheduler.enable_heartbeat();
    assert_eq!(scheduler.next_wake(), Some(Duration::from_millis(2_300)));
}

#[test]
fn losing_the_bus_drops_timers_and_restarts_at_tick_zero() {
    let mut scheduler = Scheduler::new();
    scheduler.bus_ready(Duration::ZERO);
    scheduler.begin_heartbeat(Duration::ZERO);
    scheduler.begin_heartbeat(Duration::from_secs(1));
    scheduler.insert_timer(Duration::from_secs(2), TimerAction::ReadAdConverters);

    scheduler.bus_lost();
    assert!(!scheduler.has_bus());
    assert!(scheduler.timers().is_empty());
    scheduler.enable_heartbeat();
    assert_eq!(scheduler.next_wake(), None);

    scheduler.bus_ready(Duration::from_secs(5));
    assert!(scheduler.has_bus());
    assert_eq!(scheduler.tick(), 0);
    assert!(scheduler.pending().is_empty());
}
