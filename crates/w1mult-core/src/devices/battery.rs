//! DS2438 smart battery monitor.
//!
//! Temperature and voltage are sampled on separate queues. Temperature
//! conversions are started per device, since a broadcast Convert T would
//! also start every DS18B20 on the branch. Voltage conversions are
//! broadcast. The device ignores commands while converting or copying to
//! EEPROM, so every access first waits out [`BUSY_TIME`].

use std::time::Duration;

use log::{debug, info};

use crate::logstore::{Hysteresis, LogSlot, LogStore};
use crate::program::Program;
use crate::request::{check, Reply};
use crate::retry::with_retries;
use crate::scheduler::SamplingQueue;
use crate::status::{RequestError, W1Error};
use crate::topology::{do_all, BranchId, BranchWork, Bus, DeviceId, EachDevice};

use super::{check_page, log_slot, Family, Sample, PAGE_READ_LEN};

/// Copy a memory page to the scratchpad.
pub const RECALL_MEMORY: u8 = 0xB8;
/// Read a scratchpad page.
pub const READ_SCRATCHPAD: u8 = 0xBE;
/// Write a scratchpad page.
pub const WRITE_SCRATCHPAD: u8 = 0x4E;
/// Copy a scratchpad page to memory.
pub const COPY_SCRATCHPAD: u8 = 0x48;
/// Start a temperature conversion.
pub const CONVERT_T: u8 = 0x44;
/// Start a voltage conversion.
pub const CONVERT_V: u8 = 0xB4;

/// Longest conversion or EEPROM copy.
pub const BUSY_TIME: Duration = Duration::from_millis(10);

/// Status polls before a conversion that never ends is a timeout.
pub const MAX_BUSY_POLLS: usize = 8;

/// Current A/D enabled.
pub const IAD: u8 = 0x01;
/// Current accumulator enabled.
pub const CA: u8 = 0x02;
/// Accumulator shadowed to EEPROM.
pub const EE: u8 = 0x04;
/// Voltage input is VDD rather than VAD.
pub const AD: u8 = 0x08;
/// Temperature conversion busy.
pub const TB: u8 = 0x10;
/// Voltage conversion busy.
pub const ADB: u8 = 0x40;

/// Configuration bits the device lets us write.
pub const WRITABLE_CONFIG: u8 = IAD | CA | EE | AD;

/// Configuration after power-up: accumulating to EEPROM, reading VDD.
pub const DEFAULT_CONFIG: u8 = IAD | CA | EE | AD;

/// Current measurement setting. The value is the IAD, CA and EE bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum CurrentMode {
    /// No current measurement.
    Off = 0,
    /// Measure without accumulating.
    NoAccum = IAD,
    /// Accumulate in volatile memory.
    AccumNoEe = IAD | CA,
    /// Accumulate and shadow to EEPROM.
    AccumEe = IAD | CA | EE,
}

/// Voltage A/D input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum VoltageInput {
    /// The VAD pin.
    Vad = 0,
    /// The supply voltage.
    Vdd = 1,
}

/// One sampled value stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Bits kept of each reading.
    pub mask: i32,
    /// Logging filter.
    pub hysteresis: Hysteresis,
    /// Log slot, once configured.
    pub slot: Option<LogSlot>,
    /// Last value read.
    pub last: Option<Sample>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            mask: -1,
            hysteresis: Hysteresis::new(0),
            slot: None,
            last: None,
        }
    }
}

/// DS2438 state. Temperatures are in 1/32 degree, voltages in 10 mV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryMonitor {
    /// Status/configuration register as we want it.
    pub config: u8,
    /// Current offset threshold register.
    pub threshold: u8,
    /// Voltage input being sampled.
    pub input: VoltageInput,
    /// Temperature stream.
    pub temperature: Channel,
    /// Voltage stream.
    pub voltage: Channel,
}

impl Default for BatteryMonitor {
    fn default() -> Self {
        Self {
            config: DEFAULT_CONFIG,
            threshold: 0,
            input: VoltageInput::Vdd,
            temperature: Channel::default(),
            voltage: Channel::default(),
        }
    }
}

/// Temperature mask for a resolution of -6 (64 degree steps) to 5 (full
/// 1/32 degree).
#[must_use]
pub fn temperature_mask(resolution: i8) -> i32 {
    let shift = u32::from((resolution.clamp(-6, 5) + 6).unsigned_abs());
    (-(1i32 << 11)) >> shift
}

/// Voltage mask for a resolution of -9 to 0 (full 10 mV).
#[must_use]
pub fn voltage_mask(resolution: i8) -> i32 {
    let shift = u32::from((resolution.clamp(-9, 0) + 9).unsigned_abs());
    (-(1i32 << 9)) >> shift
}

/// Requests understood by battery monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BatteryRequest {
    /// Sample temperature every `2^log2` heartbeats; 255 stops sampling.
    ConfigureTemperature {
        /// Sampling period exponent.
        log2: u8,
        /// Resolution -6 to 5.
        resolution: i8,
        /// Logging threshold, below 32768.
        hysteresis: u16,
    },
    /// Sample voltage on `input` every `2^log2` heartbeats; 255 stops
    /// sampling.
    ConfigureVoltage {
        /// Input to convert.
        input: VoltageInput,
        /// Sampling period exponent.
        log2: u8,
        /// Resolution -9 to 0.
        resolution: i8,
        /// Logging threshold, below 32768.
        hysteresis: u16,
    },
    /// Current measurement mode.
    ConfigureCurrent(CurrentMode),
    /// Reads the current register now.
    ReadCurrent,
    /// Current offset threshold.
    ReadThreshold,
    /// Sets the current offset threshold.
    WriteThreshold(u8),
    /// Reads user page 1 to 7.
    ReadPage(u8),
    /// Writes user page 1 to 7.
    WritePage {
        /// Page number.
        page: u8,
        /// Page contents.
        data: [u8; 8],
    },
    /// Last temperature read.
    ReadTemperature,
    /// Last voltage read.
    ReadVoltage,
}

/// Battery monitor queues and the bus-wide busy window.
#[derive(Debug, Default)]
pub struct BatteryRoster {
    /// Temperature sampling buckets.
    pub temperature_queue: SamplingQueue,
    /// Voltage sampling buckets.
    pub voltage_queue: SamplingQueue,
    last_convert_t: Option<Duration>,
    vee_expiry: Duration,
}

impl BatteryRoster {
    /// Time after which no battery monitor is converting or copying.
    #[must_use]
    pub fn busy_until(&self) -> Duration {
        self.last_convert_t
            .map_or(Duration::ZERO, |t| t + BUSY_TIME)
            .max(self.vee_expiry)
    }

    fn wait_until_not_busy(&self, bus: &Bus) {
        bus.sleep_until(self.busy_until());
    }

    pub(crate) fn abandon(&mut self) {
        self.last_convert_t = None;
        self.vee_expiry = Duration::ZERO;
    }
}

fn state(bus: &Bus, id: DeviceId) -> Option<&BatteryMonitor> {
    match &bus.net().device(id).family {
        Family::BatteryMonitor(state) => Some(state),
        _ => None,
    }
}

fn state_mut(bus: &mut Bus, id: DeviceId) -> Option<&mut BatteryMonitor> {
    match &mut bus.net_mut().device_mut(id).family {
        Family::BatteryMonitor(state) => Some(state),
        _ => None,
    }
}

fn read_page(bus: &mut Bus, id: DeviceId, page: u8, path_active: bool) -> Result<[u8; 8], W1Error> {
    with_retries("battery page read", |_| {
        let mut program = Program::new();
        if path_active {
            bus.readdress(&mut program, id);
        } else {
            bus.address_device(&mut program, id);
        }
        program.write_bytes(&[RECALL_MEMORY, page]);
        bus.readdress(&mut program, id);
        program
            .write_bytes(&[READ_SCRATCHPAD, page])
            .read_bytes(PAGE_READ_LEN);
        check_page(&bus.run_ok(&program)?)
    })
}

fn page_matches(page: u8, wrote: &[u8; 8], read: &[u8; 8]) -> bool {
    if page == 0 {
        (wrote[0] ^ read[0]) & WRITABLE_CONFIG == 0 && wrote[7] == read[7]
    } else {
        wrote == read
    }
}

/// Writes a page through the scratchpad, verifies it, and copies it.
/// The caller waits out any conversion first.
fn write_page(
    bus: &mut Bus,
    roster: &mut BatteryRoster,
    id: DeviceId,
    page: u8,
    data: [u8; 8],
) -> Result<(), W1Error> {
    with_retries("battery page write", |_| {
        let mut program = Program::new();
        bus.address_device(&mut program, id);
        program.write_bytes(&[WRITE_SCRATCHPAD, page]).write_bytes(&data);
        bus.readdress(&mut program, id);
        program
            .write_bytes(&[READ_SCRATCHPAD, page])
            .read_bytes(PAGE_READ_LEN);
        let read = check_page(&bus.run_ok(&program)?)?;
        if page_matches(page, &data, &read) {
            Ok(())
        } else {
            debug!(target: "w1mult::bus", "battery page {page} read back {read:02x?}");
            Err(W1Error::CrcError)
        }
    })?;
    let mut program = Program::new();
    bus.address_device(&mut program, id);
    program.write_bytes(&[COPY_SCRATCHPAD, page]);
    bus.run_ok(&program)?;
    roster.vee_expiry = bus.now() + BUSY_TIME;
    Ok(())
}

fn set_configuration(bus: &mut Bus, roster: &mut BatteryRoster, id: DeviceId) -> Result<(), W1Error> {
    let Some(monitor) = state(bus, id) else {
        return Ok(());
    };
    let mut data = [0u8; 8];
    data[0] = monitor.config;
    data[7] = monitor.threshold;
    roster.wait_until_not_busy(bus);
    write_page(bus, roster, id, 0, data)
}

fn set_configuration_if_found(
    bus: &mut Bus,
    roster: &mut BatteryRoster,
    id: DeviceId,
) -> Result<(), W1Error> {
    if bus.net().device(id).found {
        set_configuration(bus, roster, id)
    } else {
        Ok(())
    }
}

/// Initialises a battery monitor found by a scan: rewrites page 0 if the
/// configuration or threshold differ, and logs the next readings.
///
/// # Errors
///
/// Bus errors once the retries are used up.
pub fn init(bus: &mut Bus, roster: &mut BatteryRoster, id: DeviceId) -> Result<(), W1Error> {
    if let Some(monitor) = state_mut(bus, id) {
        monitor.temperature.hysteresis.rearm();
        monitor.voltage.hysteresis.rearm();
    }
    roster.wait_until_not_busy(bus);
    let page = read_page(bus, id, 0, false)?;
    let stale = state(bus, id).is_some_and(|monitor| {
        (page[0] ^ monitor.config) & WRITABLE_CONFIG != 0 || page[7] != monitor.threshold
    });
    if stale {
        set_configuration(bus, roster, id)?;
    }
    info!(target: "w1mult::bus", "battery monitor {} is found", bus.net().device(id).rom);
    Ok(())
}

/// Reads page 0 until `busy` clears.
fn poll_page0(bus: &mut Bus, id: DeviceId, busy: u8) -> Result<[u8; 8], W1Error> {
    for _ in 0..MAX_BUSY_POLLS {
        let page = read_page(bus, id, 0, true)?;
        if page[0] & busy == 0 {
            return Ok(page);
        }
    }
    Err(W1Error::Timeout)
}

fn read_temperature(
    bus: &mut Bus,
    roster: &mut BatteryRoster,
    logs: &mut dyn LogStore,
    id: DeviceId,
) -> Result<(), W1Error> {
    roster.wait_until_not_busy(bus);
    let mut program = Program::new();
    bus.readdress(&mut program, id);
    program.write_byte(CONVERT_T);
    bus.run_ok(&program)?;
    let timestamp = bus.now();
    roster.last_convert_t = Some(timestamp);
    roster.wait_until_not_busy(bus);
    let page = poll_page0(bus, id, TB)?;
    let Some(monitor) = state_mut(bus, id) else {
        return Ok(());
    };
    let raw = i16::from_le_bytes([page[1], page[2]]) >> 3;
    let value = i32::from(raw) & monitor.temperature.mask;
    monitor.temperature.last = Some(Sample { value, timestamp });
    if let Some(slot) = monitor.temperature.slot {
        monitor.temperature.hysteresis.log(logs, slot, timestamp, value, 0);
    }
    Ok(())
}

fn read_voltage(
    bus: &mut Bus,
    logs: &mut dyn LogStore,
    id: DeviceId,
    timestamp: Duration,
) -> Result<(), W1Error> {
    let page = poll_page0(bus, id, ADB)?;
    let Some(monitor) = state_mut(bus, id) else {
        return Ok(());
    };
    let value = i32::from(u16::from_le_bytes([page[3], page[4]])) & monitor.voltage.mask;
    let aux = monitor.input as u32;
    monitor.voltage.last = Some(Sample { value, timestamp });
    if let Some(slot) = monitor.voltage.slot {
        monitor.voltage.hysteresis.log(logs, slot, timestamp, value, aux);
    }
    Ok(())
}

struct ConvertV;

impl BranchWork for ConvertV {
    fn on_branch(&mut self, bus: &mut Bus, branch: BranchId) -> Result<(), W1Error> {
        let mut program = Program::new();
        bus.ensure_branch_smart_reset(&mut program, branch);
        program.skip_rom().write_byte(CONVERT_V);
        bus.run_ok(&program).map(drop)
    }
}

/// Samples the battery monitors due at `tick`: temperatures one device at
/// a time, then voltages after one broadcast conversion. Returns once no
/// monitor is busy, so a following broadcast cannot confuse them.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn heartbeat(
    bus: &mut Bus,
    roster: &mut BatteryRoster,
    logs: &mut dyn LogStore,
    tick: u32,
) -> Result<(), W1Error> {
    let due = roster.temperature_queue.due(tick);
    let marked = bus.net_mut().mark_for_sampling(&due);
    if !marked.is_empty() {
        let mut work = EachDevice::new(|bus: &mut Bus, id: DeviceId| {
            read_temperature(bus, &mut *roster, &mut *logs, id)
        });
        let result = do_all(bus, BranchId::ROOT, &mut work);
        bus.net_mut().finish_pass(&marked);
        result?;
    }

    let due = roster.voltage_queue.due(tick);
    let marked = bus.net_mut().mark_for_sampling(&due);
    if marked.is_empty() {
        return Ok(());
    }
    let result = do_all(bus, BranchId::ROOT, &mut ConvertV);
    bus.net_mut().finish_pass(&marked);
    result?;

    let timestamp = bus.now();
    roster.vee_expiry = timestamp + BUSY_TIME;
    roster.wait_until_not_busy(bus);
    // The convert pass used up the branch marks.
    let marked = bus.net_mut().mark_for_sampling(&marked);
    let mut work = EachDevice::new(|bus: &mut Bus, id: DeviceId| {
        read_voltage(bus, &mut *logs, id, timestamp)
    });
    let result = do_all(bus, BranchId::ROOT, &mut work);
    bus.net_mut().finish_pass(&marked);
    result
}

fn require_found(bus: &Bus, id: DeviceId) -> Result<(), RequestError> {
    if bus.net().device(id).found {
        Ok(())
    } else {
        Err(RequestError::Offline)
    }
}

fn sample(channel: &Channel) -> Reply {
    Reply::Sample(channel.last)
}

/// Serves a battery monitor request.
///
/// # Errors
///
/// `InvalidRequest` for out-of-range parameters, `Offline` for reads of a
/// device that is not present, and bus errors from present devices.
pub fn request(
    bus: &mut Bus,
    roster: &mut BatteryRoster,
    logs: &mut dyn LogStore,
    id: DeviceId,
    request: BatteryRequest,
) -> Result<Reply, RequestError> {
    let Some(monitor) = state(bus, id).cloned() else {
        return Err(RequestError::InvalidRequest);
    };
    match request {
        BatteryRequest::ConfigureTemperature {
            log2,
            resolution,
            hysteresis,
        } => {
            let resolution = check(resolution, -6..=5)?;
            let hysteresis = check(hysteresis, 0..=0x7FFF)?;
            let slot = log_slot(logs, monitor.temperature.slot)?;
            if let Some(monitor) = state_mut(bus, id) {
                monitor.temperature.mask = temperature_mask(resolution);
                monitor.temperature.hysteresis = Hysteresis::new(i32::from(hysteresis));
                monitor.temperature.slot = Some(slot);
            }
            roster.temperature_queue.place(id, log2);
            Ok(Reply::Log(logs.read_handle(slot)))
        }
        BatteryRequest::ConfigureVoltage {
            input,
            log2,
            resolution,
            hysteresis,
        } => {
            let resolution = check(resolution, -9..=0)?;
            let hysteresis = check(hysteresis, 0..=0x7FFF)?;
            let slot = log_slot(logs, monitor.voltage.slot)?;
            let vdd = input == VoltageInput::Vdd;
            if (monitor.config & AD != 0) != vdd {
                if let Some(monitor) = state_mut(bus, id) {
                    monitor.config ^= AD;
                }
                set_configuration_if_found(bus, roster, id)?;
            }
            if let Some(monitor) = state_mut(bus, id) {
                monitor.input = input;
                monitor.voltage.mask = voltage_mask(resolution);
                monitor.voltage.hysteresis = Hysteresis::new(i32::from(hysteresis));
                monitor.voltage.slot = Some(slot);
            }
            roster.voltage_queue.place(id, log2);
            Ok(Reply::Log(logs.read_handle(slot)))
        }
        BatteryRequest::ConfigureCurrent(mode) => {
            let config = (monitor.config & !(IAD | CA | EE)) | mode as u8;
            if config != monitor.config {
                if let Some(monitor) = state_mut(bus, id) {
                    monitor.config = config;
                }
                set_configuration_if_found(bus, roster, id)?;
            }
            Ok(Reply::Done)
        }
        BatteryRequest::ReadCurrent => {
            require_found(bus, id)?;
            roster.wait_until_not_busy(bus);
            let page = read_page(bus, id, 0, false)?;
            Ok(Reply::Sample(Some(Sample {
                value: i32::from(i16::from_le_bytes([page[5], page[6]])),
                timestamp: bus.now(),
            })))
        }
        BatteryRequest::ReadThreshold => Ok(Reply::Byte(monitor.threshold)),
        BatteryRequest::WriteThreshold(threshold) => {
            let measuring = monitor.config & IAD != 0;
            if measuring {
                if let Some(monitor) = state_mut(bus, id) {
                    monitor.config &= !IAD;
                }
                set_configuration_if_found(bus, roster, id)?;
            }
            if let Some(monitor) = state_mut(bus, id) {
                monitor.threshold = threshold;
            }
            set_configuration_if_found(bus, roster, id)?;
            if measuring {
                if let Some(monitor) = state_mut(bus, id) {
                    monitor.config |= IAD;
                }
                set_configuration_if_found(bus, roster, id)?;
            }
            Ok(Reply::Done)
        }
        BatteryRequest::ReadPage(page) => {
            let page = check(page, 1..=7)?;
            require_found(bus, id)?;
            roster.wait_until_not_busy(bus);
            Ok(Reply::Page(read_page(bus, id, page, false)?))
        }
        BatteryRequest::WritePage { page, data } => {
            let page = check(page, 1..=7)?;
            require_found(bus, id)?;
            roster.wait_until_not_busy(bus);
            write_page(bus, roster, id, page, data)?;
            Ok(Reply::Done)
        }
        BatteryRequest::ReadTemperature => Ok(sample(&monitor.temperature)),
        BatteryRequest::ReadVoltage => Ok(sample(&monitor.voltage)),
    }
}

#[cfg(test)]
mod tests {
    use super::{page_matches, temperature_mask, voltage_mask, CurrentMode, ADB, TB};
    use rstest::rstest;

    #[rstest]
    #[case(5, -1)]
    #[case(0, -32)]
    #[case(-6, -2048)]
    fn temperature_mask_drops_low_bits(#[case] resolution: i8, #[case] mask: i32) {
        assert_eq!(temperature_mask(resolution), mask);
    }

    #[rstest]
    #[case(0, -1)]
    #[case(-1, -2)]
    #[case(-9, -512)]
    fn voltage_mask_drops_low_bits(#[case] resolution: i8, #[case] mask: i32) {
        assert_eq!(voltage_mask(resolution), mask);
    }

    #[test]
    fn current_modes_are_register_bits() {
        assert_eq!(CurrentMode::Off as u8, 0);
        assert_eq!(CurrentMode::NoAccum as u8, 1);
        assert_eq!(CurrentMode::AccumNoEe as u8, 3);
        assert_eq!(CurrentMode::AccumEe as u8, 7);
    }

    #[test]
    fn page_zero_compares_only_writable_bits() {
        let wrote = [0x0F, 0, 0, 0, 0, 0, 0, 0x22];
        let mut read = [0x0F | TB | ADB, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0x22];
        assert!(page_matches(0, &wrote, &read));
        assert!(!page_matches(1, &wrote, &read));
        read[7] = 0x23;
        assert!(!page_matches(0, &wrote, &read));
    }
}
