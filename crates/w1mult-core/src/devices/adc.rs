//! DS2450 quad A/D converter.
//!
//! Port configuration lives in memory page 1 (addresses 8 to 15, two bytes
//! per port). Memory writes return an inverted CRC-16 and an echo of each
//! byte; the first CRC covers the command and address, later ones are
//! seeded with the address of the byte written.

use std::time::Duration;

use log::{debug, info, warn};

use crate::crc::Crc16;
use crate::logstore::{Hysteresis, LogSlot, LogStore};
use crate::program::Program;
use crate::request::Reply;
use crate::retry::with_retries;
use crate::scheduler::{
    HeartbeatHold, Reason, SamplingQueue, Scheduler, TimerAction, MAX_LOG2_SECONDS,
};
use crate::status::{RequestError, W1Error};
use crate::topology::{do_all, BranchId, BranchWork, Bus, DeviceId, EachDevice};

use super::{log_slot, Family, Sample};

/// Read memory with CRC-16.
pub const READ_MEMORY: u8 = 0xAA;
/// Write memory with CRC-16 and echo.
pub const WRITE_MEMORY: u8 = 0x55;
/// Convert the selected inputs.
pub const CONVERT: u8 = 0x3C;

/// Address of the conversion results.
pub const RESULTS_PAGE: u8 = 0x00;
/// Address of the port configuration.
pub const CONFIG_PAGE: u8 = 0x08;
/// Address of the VCC calibration byte.
pub const CALIBRATION_ADDRESS: u8 = 0x1C;
/// Calibration value for a VCC-powered device.
pub const VCC_POWERED: u8 = 0x40;

/// Conversion time of all four inputs at 16 bits.
pub const CONVERSION_TIME: Duration = Duration::from_micros(5120);

/// Output conducting (control byte low).
pub const OC: u8 = 0x40;
/// Output enabled (control byte low).
pub const OE: u8 = 0x80;
/// 5.12 V input range (control byte high).
pub const IR: u8 = 0x01;
/// Power-on reset flag (control byte high).
pub const POR: u8 = 0x80;

/// How one port is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PortConfig {
    /// Analog input.
    Input {
        /// Bits to convert, 1 to 16.
        bits: u8,
        /// 5.12 V range instead of 2.56 V.
        high_range: bool,
        /// Sampling period exponent.
        log2: u8,
        /// Logging threshold.
        hysteresis: u16,
    },
    /// Open-drain output.
    Output {
        /// Pull the pin low.
        conducting: bool,
    },
}

impl PortConfig {
    /// The two control bytes of the port.
    #[must_use]
    pub const fn control(self) -> [u8; 2] {
        match self {
            Self::Input {
                bits, high_range, ..
            } => [bits & 0x0F, if high_range { IR } else { 0 }],
            Self::Output { conducting } => [OE | if conducting { OC } else { 0 } | 1, IR],
        }
    }
}

/// One input port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Port {
    /// Logging filter.
    pub hysteresis: Hysteresis,
    /// Log slot, once configured as an input.
    pub slot: Option<LogSlot>,
    /// Last value read.
    pub last: Option<Sample>,
}

/// DS2450 state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdConverter {
    /// Control bytes the client asked for; `None` until configured.
    pub requested: Option<[u8; 8]>,
    /// Control bytes last known to be in the device.
    pub device: [u8; 8],
    /// Per-port logging state.
    pub ports: [Port; 4],
}

impl AdConverter {
    /// Returns `true` when port `index` is configured as an input.
    #[must_use]
    pub fn is_input(&self, index: usize) -> bool {
        self.requested
            .is_some_and(|bytes| bytes[index * 2] & OE == 0)
    }
}

/// Requests understood by A/D converters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AdRequest {
    /// Configures all four ports.
    ConfigurePorts([PortConfig; 4]),
    /// Last values of the four ports.
    ReadPorts,
}

/// A/D converter queue, conversion in flight and deferred configuration.
#[derive(Debug, Default)]
pub struct AdRoster {
    /// Sampling buckets.
    pub queue: SamplingQueue,
    marked: Vec<DeviceId>,
    hold: Option<HeartbeatHold>,
    deferred: Vec<DeviceId>,
    sampled_at: Duration,
}

impl AdRoster {
    /// Returns `true` from the start of a heartbeat until its results are
    /// read. Configuration changes wait until then.
    #[must_use]
    pub const fn is_converting(&self) -> bool {
        self.hold.is_some()
    }

    pub(crate) fn abandon(&mut self) {
        self.marked.clear();
        self.hold = None;
        self.deferred.clear();
    }
}

fn state(bus: &Bus, id: DeviceId) -> Option<&AdConverter> {
    match &bus.net().device(id).family {
        Family::AdConverter(state) => Some(state),
        _ => None,
    }
}

fn state_mut(bus: &mut Bus, id: DeviceId) -> Option<&mut AdConverter> {
    match &mut bus.net_mut().device_mut(id).family {
        Family::AdConverter(state) => Some(state),
        _ => None,
    }
}

/// Checks a read-memory response: 8 data bytes and the inverted CRC-16 of
/// the command, address and data.
///
/// # Errors
///
/// `CrcError` on a mismatch, `BusError` on a short read.
pub fn check_memory_page(address: u8, data: &[u8]) -> Result<[u8; 8], W1Error> {
    let Some(bytes) = data.get(..10) else {
        return Err(W1Error::BusError);
    };
    let mut crc = Crc16::new();
    crc.update_all(&[READ_MEMORY, address, 0]);
    crc.update_all(&bytes[..8]);
    if !crc.matches_inverted(bytes[8], bytes[9]) {
        return Err(W1Error::CrcError);
    }
    let mut page = [0u8; 8];
    page.copy_from_slice(&bytes[..8]);
    Ok(page)
}

fn read_memory_page(
    bus: &mut Bus,
    id: DeviceId,
    address: u8,
    path_active: bool,
) -> Result<[u8; 8], W1Error> {
    with_retries("a/d page read", |_| {
        let mut program = Program::new();
        if path_active {
            bus.readdress(&mut program, id);
        } else {
            bus.address_device(&mut program, id);
        }
        program
            .write_bytes(&[READ_MEMORY, address, 0])
            .read_bytes(10);
        check_memory_page(address, &bus.run_ok(&program)?)
    })
}

/// Verifies the CRC-16 and echo returned after each written byte.
fn check_write_replies(start: u8, bytes: &[u8], replies: &[u8]) -> Result<(), W1Error> {
    if replies.len() < bytes.len() * 3 {
        return Err(W1Error::BusError);
    }
    for (index, (&byte, reply)) in bytes.iter().zip(replies.chunks_exact(3)).enumerate() {
        let mut crc = if index == 0 {
            let mut crc = Crc16::new();
            crc.update_all(&[WRITE_MEMORY, start, 0]);
            crc
        } else {
            Crc16::with_seed(u16::from(start).wrapping_add(u16::try_from(index).unwrap_or(0)))
        };
        crc.update(byte);
        if !crc.matches_inverted(reply[0], reply[1]) {
            return Err(W1Error::CrcError);
        }
        if reply[2] != byte {
            debug!(
                target: "w1mult::bus",
                "a/d write memory wrote {byte:#04x}, got {:#04x}",
                reply[2]
            );
            return Err(W1Error::BusError);
        }
    }
    Ok(())
}

/// Writes `bytes` to consecutive memory addresses from `start`, verifying
/// each byte, in one transaction.
///
/// # Errors
///
/// The last bus, CRC or echo error once the retries are used up.
pub fn write_memory(bus: &mut Bus, id: DeviceId, start: u8, bytes: &[u8]) -> Result<(), W1Error> {
    let Some((&first, rest)) = bytes.split_first() else {
        return Ok(());
    };
    with_retries("a/d memory write", |_| {
        let mut program = Program::new();
        bus.address_device(&mut program, id);
        program
            .write_bytes(&[WRITE_MEMORY, start, 0, first])
            .read_bytes(3);
        for &byte in rest {
            program.write_byte(byte).read_bytes(3);
        }
        check_write_replies(start, bytes, &bus.run_ok(&program)?)
    })
}

/// Sends the requested control bytes that differ from the device's.
fn send_config(bus: &mut Bus, id: DeviceId) -> Result<(), W1Error> {
    let Some((requested, device)) = state(bus, id).and_then(|s| s.requested.map(|r| (r, s.device)))
    else {
        return Ok(());
    };
    let differs = |i: &usize| requested[*i] != device[*i];
    let (Some(first), Some(last)) = ((0..8).find(differs), (0..8).rev().find(differs)) else {
        return Ok(());
    };
    debug!(
        target: "w1mult::bus",
        "a/d {} config bytes {first}..={last}",
        bus.net().device(id).rom
    );
    let start = CONFIG_PAGE + u8::try_from(first).unwrap_or(0);
    write_memory(bus, id, start, &requested[first..=last])?;
    if let Some(state) = state_mut(bus, id) {
        state.device = requested;
    }
    Ok(())
}

/// Sends the configuration now, or after the conversion in flight.
fn check_configured(bus: &mut Bus, roster: &mut AdRoster, id: DeviceId) -> Result<(), W1Error> {
    let stale = state(bus, id).is_some_and(|s| s.requested.is_some_and(|r| r != s.device));
    if !stale {
        return Ok(());
    }
    if roster.is_converting() {
        if !roster.deferred.contains(&id) {
            roster.deferred.push(id);
        }
        Ok(())
    } else {
        send_config(bus, id)
    }
}

/// Initialises an A/D converter found by a scan: clears a power-on reset
/// by writing the VCC calibration byte, then sends any pending
/// configuration.
///
/// # Errors
///
/// Bus errors once the retries are used up.
pub fn init(bus: &mut Bus, roster: &mut AdRoster, id: DeviceId) -> Result<(), W1Error> {
    let mut device = read_memory_page(bus, id, CONFIG_PAGE, false)?;
    if device[1] & POR != 0 {
        debug!(target: "w1mult::bus", "a/d {} had a power-on reset", bus.net().device(id).rom);
        write_memory(bus, id, CALIBRATION_ADDRESS, &[VCC_POWERED])?;
        for high in device.iter_mut().skip(1).step_by(2) {
            *high &= !POR;
        }
    }
    if let Some(state) = state_mut(bus, id) {
        state.device = device;
        for port in &mut state.ports {
            port.hysteresis.rearm();
        }
    }
    info!(target: "w1mult::bus", "a/d converter {} is found", bus.net().device(id).rom);
    check_configured(bus, roster, id)
}

#[derive(Default)]
struct Convert {
    failed: bool,
}

impl BranchWork for Convert {
    fn on_branch(&mut self, bus: &mut Bus, branch: BranchId) -> Result<(), W1Error> {
        let command = [CONVERT, 0x0F, 0x00];
        let result = with_retries("a/d convert", |_| {
            let mut program = Program::new();
            bus.ensure_branch_smart_reset(&mut program, branch);
            program.skip_rom().write_bytes(&command).read_bytes(2);
            let reply = bus.run_ok(&program)?;
            let mut crc = Crc16::new();
            crc.update_all(&command);
            match reply.as_slice() {
                [lo, hi, ..] if crc.matches_inverted(*lo, *hi) => Ok(()),
                _ => Err(W1Error::CrcError),
            }
        });
        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

/// Starts a conversion on the A/D converters due at `tick` and schedules
/// the read. The heartbeat stays held until the results are read.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn heartbeat(
    bus: &mut Bus,
    roster: &mut AdRoster,
    scheduler: &mut Scheduler,
    tick: u32,
) -> Result<(), W1Error> {
    roster.hold = Some(scheduler.hold(Reason::AdConverter));
    let due = roster.queue.due(tick);
    let marked = bus.net_mut().mark_for_sampling(&due);
    if marked.is_empty() {
        return end_heartbeat(bus, roster, scheduler);
    }
    let mut convert = Convert::default();
    let result = do_all(bus, BranchId::ROOT, &mut convert);
    bus.net_mut().finish_pass(&marked);
    if result.is_err() || convert.failed {
        let ended = end_heartbeat(bus, roster, scheduler);
        return result.and(ended);
    }
    let now = bus.now();
    roster.sampled_at = now;
    roster.marked = marked;
    scheduler.insert_timer(now + CONVERSION_TIME, TimerAction::ReadAdConverters);
    Ok(())
}

fn read_ports(
    bus: &mut Bus,
    logs: &mut dyn LogStore,
    id: DeviceId,
    timestamp: Duration,
) -> Result<(), W1Error> {
    let page = read_memory_page(bus, id, RESULTS_PAGE, true)?;
    let Some(state) = state_mut(bus, id) else {
        return Ok(());
    };
    for index in 0..4 {
        if !state.is_input(index) {
            continue;
        }
        let value = i32::from(u16::from_le_bytes([page[index * 2], page[index * 2 + 1]]));
        let port = &mut state.ports[index];
        port.last = Some(Sample { value, timestamp });
        if let Some(slot) = port.slot {
            let aux = u32::try_from(index).unwrap_or(0);
            port.hysteresis.log(logs, slot, timestamp, value, aux);
        }
    }
    Ok(())
}

/// Reads the conversions started by the last heartbeat, then sends any
/// configuration deferred meanwhile and lets the next heartbeat proceed.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn read_results(
    bus: &mut Bus,
    roster: &mut AdRoster,
    logs: &mut dyn LogStore,
    scheduler: &mut Scheduler,
) -> Result<(), W1Error> {
    let marked = bus.net_mut().mark_for_sampling(&std::mem::take(&mut roster.marked));
    let timestamp = roster.sampled_at;
    let mut work = EachDevice::new(|bus: &mut Bus, id: DeviceId| {
        read_ports(bus, &mut *logs, id, timestamp)
    });
    let result = do_all(bus, BranchId::ROOT, &mut work);
    bus.net_mut().finish_pass(&marked);
    let ended = end_heartbeat(bus, roster, scheduler);
    result.and(ended)
}

/// All converters are idle: sends deferred configurations and releases
/// the heartbeat.
fn end_heartbeat(
    bus: &mut Bus,
    roster: &mut AdRoster,
    scheduler: &mut Scheduler,
) -> Result<(), W1Error> {
    let hold = roster.hold.take();
    let mut result = Ok(());
    for id in std::mem::take(&mut roster.deferred) {
        if !bus.net().device(id).found {
            continue;
        }
        match check_configured(bus, roster, id) {
            Err(error) if error.aborts_pass() => {
                result = Err(error);
                break;
            }
            Err(error) => warn!(
                target: "w1mult::bus",
                "a/d {} configuration failed: {error}",
                bus.net().device(id).rom
            ),
            Ok(()) => {}
        }
    }
    if let Some(hold) = hold {
        scheduler.release(hold);
    }
    result
}

/// Serves an A/D converter request.
///
/// # Errors
///
/// `InvalidRequest` for an input with 0 or more than 16 bits; bus errors
/// from configuring a present device.
pub fn request(
    bus: &mut Bus,
    roster: &mut AdRoster,
    logs: &mut dyn LogStore,
    id: DeviceId,
    request: AdRequest,
) -> Result<Reply, RequestError> {
    let Some(converter) = state(bus, id).cloned() else {
        return Err(RequestError::InvalidRequest);
    };
    match request {
        AdRequest::ConfigurePorts(ports) => {
            if ports
                .iter()
                .any(|p| matches!(p, PortConfig::Input { bits, .. } if !(1..=16).contains(bits)))
            {
                return Err(RequestError::InvalidRequest);
            }
            let mut slots = [None; 4];
            for (index, port) in ports.iter().enumerate() {
                if matches!(port, PortConfig::Input { .. }) {
                    slots[index] = Some(log_slot(logs, converter.ports[index].slot)?);
                }
            }
            let mut requested = [0u8; 8];
            let mut log2 = MAX_LOG2_SECONDS;
            for (index, port) in ports.iter().enumerate() {
                requested[index * 2..index * 2 + 2].copy_from_slice(&port.control());
                if let PortConfig::Input { log2: period, .. } = *port {
                    log2 = log2.min(period);
                }
            }
            if let Some(state) = state_mut(bus, id) {
                state.requested = Some(requested);
                for ((port, config), slot) in state.ports.iter_mut().zip(&ports).zip(slots) {
                    let threshold = match *config {
                        PortConfig::Input { hysteresis, .. } => i32::from(hysteresis),
                        PortConfig::Output { .. } => 0,
                    };
                    port.hysteresis = Hysteresis::new(threshold);
                    if slot.is_some() {
                        port.slot = slot;
                    }
                }
            }
            roster.queue.place(id, log2);
            if bus.net().device(id).found {
                check_configured(bus, roster, id)?;
            }
            Ok(Reply::PortLogs(slots.map(|slot| slot.map(|s| logs.read_handle(s)))))
        }
        AdRequest::ReadPorts => Ok(Reply::Ports([
            converter.ports[0].last,
            converter.ports[1].last,
            converter.ports[2].last,
            converter.ports[3].last,
        ])),
    }
}

#[cfg(test)]
mod tests {
    use super::{check_memory_page, check_write_replies, PortConfig, READ_MEMORY, WRITE_MEMORY};
    use crate::crc::Crc16;
    use crate::status::W1Error;

    fn write_reply(crc: Crc16, byte: u8) -> [u8; 3] {
        let [lo, hi] = crc.inverted_bytes();
        [lo, hi, byte]
    }

    #[test]
    fn control_bytes_follow_port_use() {
        let input = PortConfig::Input {
            bits: 16,
            high_range: true,
            log2: 0,
            hysteresis: 0,
        };
        assert_eq!(input.control(), [0x00, 0x01]);
        let input = PortConfig::Input {
            bits: 12,
            high_range: false,
            log2: 0,
            hysteresis: 0,
        };
        assert_eq!(input.control(), [0x0C, 0x00]);
        assert_eq!(PortConfig::Output { conducting: true }.control(), [0xC1, 0x01]);
        assert_eq!(PortConfig::Output { conducting: false }.control(), [0x81, 0x01]);
    }

    #[test]
    fn memory_page_crc_covers_command_and_address() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut crc = Crc16::new();
        crc.update_all(&[READ_MEMORY, 0x08, 0]);
        crc.update_all(&data);
        let mut reply = data.to_vec();
        reply.extend_from_slice(&crc.inverted_bytes());
        assert_eq!(check_memory_page(0x08, &reply), Ok(data));
        assert_eq!(check_memory_page(0x00, &reply), Err(W1Error::CrcError));
    }

    #[test]
    fn later_write_replies_are_seeded_with_their_address() {
        let mut first = Crc16::new();
        first.update_all(&[WRITE_MEMORY, 0x0A, 0, 0x11]);
        let mut second = Crc16::with_seed(0x0B);
        second.update(0x22);
        let mut replies = write_reply(first, 0x11).to_vec();
        replies.extend_from_slice(&write_reply(second, 0x22));
        assert_eq!(check_write_replies(0x0A, &[0x11, 0x22], &replies), Ok(()));

        replies[5] = 0x23;
        assert_eq!(
            check_write_replies(0x0A, &[0x11, 0x22], &replies),
            Err(W1Error::BusError)
        );
        replies[0] ^= 0xFF;
        assert_eq!(
            check_write_replies(0x0A, &[0x11, 0x22], &replies),
            Err(W1Error::CrcError)
        );
    }
}
