use std::time::Duration;

use log::{debug, info};

use crate::logstore::{Hysteresis, LogSlot, LogStore};
use crate::program::Program;
use crate::request::{check, Reply};
use crate::retry::with_retries;
use crate::scheduler::{HeartbeatHold, Reason, SamplingQueue, Scheduler, TimerAction};
use crate::status::{RequestError, W1Error};
use crate::topology::{do_all, BranchId, BranchWork, Bus, DeviceId, EachDevice};

use super::{check_page, log_slot, Family, Sample};

/// Start a temperature conversion.
pub const CONVERT_T: u8 = 0x44;
/// Write TH, TL and the configuration register.
pub const WRITE_SCRATCHPAD: u8 = 0x4E;
/// Read the 9-byte scratchpad.
pub const READ_SCRATCHPAD: u8 = 0xBE;
/// Copy the scratchpad to EEPROM.
pub const COPY_SCRATCHPAD: u8 = 0x48;

/// Scratchpad length including its CRC byte.
pub const SCRATCHPAD_LEN: u8 = super::PAGE_READ_LEN;

/// Conversion time at 12-bit resolution.
pub const MAX_CONVERSION: Duration = Duration::from_millis(750);

/// Time an EEPROM copy keeps the device busy.
pub const EEPROM_BUSY: Duration = Duration::from_millis(10);

const ALARM_HIGH_OFF: u8 = 0x7F;
const ALARM_LOW_OFF: u8 = 0x80;

/// DS18B20 state. Temperatures are in sixteenths of a degree Celsius.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thermometer {
    /// Resolution 1 to 4, meaning 9 to 12 bits.
    pub resolution: u8,
    /// Logging filter.
    pub hysteresis: Hysteresis,
    /// Log slot, once configured.
    pub slot: Option<LogSlot>,
    /// Last temperature read.
    pub last: Option<Sample>,
    /// The device ignores commands until this time.
    pub busy_until: Duration,
}

impl Default for Thermometer {
    fn default() -> Self {
        Self {
            resolution: 4,
            hysteresis: Hysteresis::new(0),
            slot: None,
            last: None,
            busy_until: Duration::ZERO,
        }
    }
}

/// Configuration register value for a resolution of 1 to 4. The low five
/// bits always read as ones.
#[must_use]
pub const fn config_register(resolution: u8) -> u8 {
    (resolution.saturating_sub(1) << 5) | 0x1F
}

/// Worst-case conversion time for a resolution of 1 to 4.
#[must_use]
pub const fn conversion_time(resolution: u8) -> Duration {
    let shift = 4u8.saturating_sub(resolution);
    Duration::from_micros(750_000u64 >> shift)
}

/// Drops the bits a resolution leaves undefined.
#[must_use]
pub const fn mask_temperature(raw: i16, resolution: u8) -> i16 {
    let undefined = 4u8.saturating_sub(resolution);
    raw & !((1i16 << undefined) - 1)
}

/// Requests understood by thermometers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ThermometerRequest {
    /// Sample every `2^log2` heartbeats at `resolution` (1 to 4), logging
    /// changes larger than `hysteresis`.
    Configure {
        /// Sampling period exponent.
        log2: u8,
        /// Resolution 1 to 4.
        resolution: u8,
        /// Logging threshold in sixteenths of a degree.
        hysteresis: u16,
    },
    /// Last temperature read.
    ReadTemperature,
}

/// Thermometer queue and conversion in flight.
#[derive(Debug, Default)]
pub struct ThermometerRoster {
    /// Sampling buckets.
    pub queue: SamplingQueue,
    marked: Vec<DeviceId>,
    hold: Option<HeartbeatHold>,
    sampled_at: Duration,
}

impl ThermometerRoster {
    /// Returns `true` between a conversion and the reading of its results.
    #[must_use]
    pub const fn is_converting(&self) -> bool {
        self.hold.is_some()
    }

    pub(crate) fn abandon(&mut self) {
        self.marked.clear();
        self.hold = None;
    }
}

fn state(bus: &Bus, id: DeviceId) -> Option<&Thermometer> {
    match &bus.net().device(id).family {
        Family::Thermometer(state) => Some(state),
        _ => None,
    }
}

fn state_mut(bus: &mut Bus, id: DeviceId) -> Option<&mut Thermometer> {
    match &mut bus.net_mut().device_mut(id).family {
        Family::Thermometer(state) => Some(state),
        _ => None,
    }
}

fn wait_ready(bus: &Bus, id: DeviceId) {
    if let Some(state) = state(bus, id) {
        bus.sleep_until(state.busy_until);
    }
}

fn read_scratchpad(bus: &mut Bus, id: DeviceId, path_active: bool) -> Result<[u8; 8], W1Error> {
    with_retries("thermometer scratchpad read", |_| {
        let mut program = Program::new();
        if path_active {
            bus.readdress(&mut program, id);
        } else {
            bus.address_device(&mut program, id);
        }
        program
            .write_byte(READ_SCRATCHPAD)
            .read_bytes(SCRATCHPAD_LEN);
        check_page(&bus.run_ok(&program)?)
    })
}

/// Writes the configuration, verifies it by reading back, and copies it
/// to EEPROM.
///
/// # Errors
///
/// The last bus or CRC error once the retries are used up.
pub fn set_configuration(bus: &mut Bus, id: DeviceId) -> Result<(), W1Error> {
    let Some(resolution) = state(bus, id).map(|s| s.resolution) else {
        return Ok(());
    };
    let config = config_register(resolution);
    wait_ready(bus, id);
    with_retries("thermometer configuration", |_| {
        let mut program = Program::new();
        bus.address_device(&mut program, id);
        program.write_bytes(&[WRITE_SCRATCHPAD, ALARM_HIGH_OFF, ALARM_LOW_OFF, config]);
        bus.readdress(&mut program, id);
        program
            .write_byte(READ_SCRATCHPAD)
            .read_bytes(SCRATCHPAD_LEN);
        let pad = check_page(&bus.run_ok(&program)?)?;
        if pad[4] == config {
            Ok(())
        } else {
            debug!(
                target: "w1mult::bus",
                "thermometer config wrote {config:#04x} read {:#04x}",
                pad[4]
            );
            Err(W1Error::CrcError)
        }
    })?;

    let mut program = Program::new();
    bus.address_device(&mut program, id);
    program.write_byte(COPY_SCRATCHPAD);
    bus.run_ok(&program)?;
    let busy_until = bus.now() + EEPROM_BUSY;
    if let Some(state) = state_mut(bus, id) {
        state.busy_until = busy_until;
    }
    Ok(())
}

/// Initialises a thermometer found by a scan: rewrites its configuration
/// if it differs, and logs the next reading.
///
/// # Errors
///
/// Bus errors once the retries are used up.
pub fn init(bus: &mut Bus, id: DeviceId) -> Result<(), W1Error> {
    if let Some(state) = state_mut(bus, id) {
        state.busy_until = Duration::ZERO;
        state.hysteresis.rearm();
    }
    let pad = read_scratchpad(bus, id, false)?;
    let wanted = state(bus, id).map(|s| config_register(s.resolution));
    if wanted.is_some_and(|config| pad[4] != config) {
        set_configuration(bus, id)?;
    }
    info!(target: "w1mult::bus", "thermometer {} is found", bus.net().device(id).rom);
    Ok(())
}

struct ConvertT;

impl BranchWork for ConvertT {
    fn on_branch(&mut self, bus: &mut Bus, branch: BranchId) -> Result<(), W1Error> {
        let mut program = Program::new();
        bus.ensure_branch_smart_reset(&mut program, branch);
        program.skip_rom().write_byte(CONVERT_T);
        bus.run_ok(&program).map(drop)
    }
}

/// Starts conversions on the thermometers due at `tick` and schedules the
/// read.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn heartbeat(
    bus: &mut Bus,
    roster: &mut ThermometerRoster,
    scheduler: &mut Scheduler,
    tick: u32,
) -> Result<(), W1Error> {
    let due = roster.queue.due(tick);
    let marked = bus.net_mut().mark_for_sampling(&due);
    if marked.is_empty() {
        return Ok(());
    }
    let resolution = marked
        .iter()
        .filter_map(|&id| state(bus, id).map(|s| s.resolution))
        .max()
        .unwrap_or(4);
    let hold = scheduler.hold(Reason::Thermometer);
    let result = do_all(bus, BranchId::ROOT, &mut ConvertT);
    bus.net_mut().finish_pass(&marked);
    if let Err(error) = result {
        scheduler.release(hold);
        return Err(error);
    }
    let now = bus.now();
    roster.sampled_at = now;
    roster.marked = marked;
    roster.hold = Some(hold);
    scheduler.insert_timer(now + conversion_time(resolution), TimerAction::ReadThermometers);
    Ok(())
}

fn read_temperature(
    bus: &mut Bus,
    logs: &mut dyn LogStore,
    id: DeviceId,
    timestamp: Duration,
) -> Result<(), W1Error> {
    let pad = read_scratchpad(bus, id, true)?;
    let Some(state) = state_mut(bus, id) else {
        return Ok(());
    };
    let raw = i16::from_le_bytes([pad[0], pad[1]]);
    let value = i32::from(mask_temperature(raw, state.resolution));
    state.last = Some(Sample { value, timestamp });
    if let Some(slot) = state.slot {
        state.hysteresis.log(logs, slot, timestamp, value, 0);
    }
    Ok(())
}

/// Reads the conversions started by the last heartbeat and lets the next
/// heartbeat proceed.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn read_results(
    bus: &mut Bus,
    roster: &mut ThermometerRoster,
    logs: &mut dyn LogStore,
    scheduler: &mut Scheduler,
) -> Result<(), W1Error> {
    let marked = bus.net_mut().mark_for_sampling(&std::mem::take(&mut roster.marked));
    let timestamp = roster.sampled_at;
    let mut work = EachDevice::new(|bus: &mut Bus, id: DeviceId| {
        read_temperature(bus, &mut *logs, id, timestamp)
    });
    let result = do_all(bus, BranchId::ROOT, &mut work);
    bus.net_mut().finish_pass(&marked);
    if let Some(hold) = roster.hold.take() {
        scheduler.release(hold);
    }
    result
}

/// Serves a thermometer request.
///
/// # Errors
///
/// `InvalidRequest` for a resolution outside 1 to 4; bus errors from
/// writing the configuration to a present device.
pub fn request(
    bus: &mut Bus,
    roster: &mut ThermometerRoster,
    logs: &mut dyn LogStore,
    id: DeviceId,
    request: ThermometerRequest,
) -> Result<Reply, RequestError> {
    match request {
        ThermometerRequest::Configure {
            log2,
            resolution,
            hysteresis,
        } => {
            let resolution = check(resolution, 1..=4)?;
            let slot = log_slot(logs, state(bus, id).and_then(|s| s.slot))?;
            if let Some(state) = state_mut(bus, id) {
                state.resolution = resolution;
                state.hysteresis = Hysteresis::new(i32::from(hysteresis));
                state.slot = Some(slot);
            }
            roster.queue.place(id, log2);
            if bus.net().device(id).found {
                set_configuration(bus, id)?;
            }
            Ok(Reply::Log(logs.read_handle(slot)))
        }
        ThermometerRequest::ReadTemperature => {
            Ok(Reply::Sample(state(bus, id).and_then(|s| s.last)))
        }
    }
}
