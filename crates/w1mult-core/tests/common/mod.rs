//! Bus layouts shared by the integration suites.

#![allow(dead_code)]

use std::time::Duration;

use w1mult_core::{
    DeviceConfig, ManualClock, MemoryLogStore, Multiplexer, Rom, Side, SimBus,
    FAMILY_AD_CONVERTER, FAMILY_BATTERY_MONITOR, FAMILY_COUPLER, FAMILY_PIO_OUTPUTS,
    FAMILY_THERMOMETER,
};

/// Configuration entry with a ROM derived from the index.
pub fn entry(index: usize, parent_index: Option<usize>, branch: Side, family: u8) -> DeviceConfig {
    let serial = u64::try_from(index).expect("small index") * 0x0101 + 0x10;
    DeviceConfig {
        index,
        parent_index,
        branch,
        rom: Rom::with_crc(family, serial),
    }
}

/// Root coupler with a thermometer on each branch, plus one device of every
/// other family on the root.
///
/// | index | device      | parent      |
/// |-------|-------------|-------------|
/// | 0     | coupler     | root        |
/// | 1     | thermometer | 0 main      |
/// | 2     | thermometer | 0 aux       |
/// | 3     | thermometer | root        |
/// | 4     | battery     | root        |
/// | 5     | a/d         | root        |
/// | 6     | pio         | root        |
pub fn mixed_bus() -> Vec<DeviceConfig> {
    vec![
        entry(0, None, Side::Main, FAMILY_COUPLER),
        entry(1, Some(0), Side::Main, FAMILY_THERMOMETER),
        entry(2, Some(0), Side::Aux, FAMILY_THERMOMETER),
        entry(3, None, Side::Main, FAMILY_THERMOMETER),
        entry(4, None, Side::Main, FAMILY_BATTERY_MONITOR),
        entry(5, None, Side::Main, FAMILY_AD_CONVERTER),
        entry(6, None, Side::Main, FAMILY_PIO_OUTPUTS),
    ]
}

/// Two levels of couplers: a root coupler whose aux branch holds a second
/// coupler, with thermometers spread over every branch.
pub fn nested_bus() -> Vec<DeviceConfig> {
    vec![
        entry(0, None, Side::Main, FAMILY_COUPLER),
        entry(1, Some(0), Side::Aux, FAMILY_COUPLER),
        entry(2, Some(0), Side::Main, FAMILY_THERMOMETER),
        entry(3, Some(0), Side::Main, FAMILY_THERMOMETER),
        entry(4, Some(1), Side::Main, FAMILY_THERMOMETER),
        entry(5, Some(1), Side::Aux, FAMILY_THERMOMETER),
        entry(6, Some(0), Side::Aux, FAMILY_THERMOMETER),
        entry(7, None, Side::Main, FAMILY_THERMOMETER),
    ]
}

/// Battery monitors behind couplers.
///
/// | index | device  | parent |
/// |-------|---------|--------|
/// | 0     | coupler | root   |
/// | 1     | coupler | 0 aux  |
/// | 2     | battery | 0 aux  |
/// | 3     | battery | 1 main |
/// | 4     | battery | root   |
pub fn battery_bus() -> Vec<DeviceConfig> {
    vec![
        entry(0, None, Side::Main, FAMILY_COUPLER),
        entry(1, Some(0), Side::Aux, FAMILY_COUPLER),
        entry(2, Some(0), Side::Aux, FAMILY_BATTERY_MONITOR),
        entry(3, Some(1), Side::Main, FAMILY_BATTERY_MONITOR),
        entry(4, None, Side::Main, FAMILY_BATTERY_MONITOR),
    ]
}

/// Engine over a simulated bus, with handles to inspect both.
pub struct Rig {
    pub mux: Multiplexer<MemoryLogStore>,
    pub sim: SimBus,
    pub clock: ManualClock,
    pub devices: Vec<DeviceConfig>,
}

impl Rig {
    /// Engine for `devices`, with the bus not yet registered.
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        let clock = ManualClock::new();
        let mux = Multiplexer::new(&devices, Box::new(clock.clone()), MemoryLogStore::new())
            .expect("valid configuration");
        let sim = SimBus::from_config(&devices);
        Self {
            mux,
            sim,
            clock,
            devices,
        }
    }

    /// Registers the simulated bus.
    pub fn start(&mut self) {
        self.mux
            .register_bus(Box::new(self.sim.clone()))
            .expect("no program defects");
    }

    /// ROM of the device at `index`.
    pub fn rom(&self, index: usize) -> Rom {
        self.devices[index].rom
    }

    /// Moves the clock to `at` and runs what is due.
    pub fn run_until(&mut self, at: Duration) -> Option<Duration> {
        self.clock.set(at);
        self.mux.poll().expect("no program defects")
    }

    /// Moves the clock to the next timer and runs it. `None` when nothing
    /// is scheduled.
    pub fn step(&mut self) -> Option<Duration> {
        let wake = self.mux.scheduler().next_wake()?;
        self.clock.set(wake);
        self.mux.poll().expect("no program defects")
    }

    /// Runs timers one after another until the clock reaches `end`.
    pub fn run_for(&mut self, end: Duration) {
        while let Some(wake) = self.mux.poll().expect("no program defects") {
            if wake > end {
                break;
            }
            self.clock.set(wake);
        }
    }
}
