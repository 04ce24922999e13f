//! Device families and their protocol handlers.
//!
//! Every family handler follows the same register discipline: address the
//! device, write, read back, compare, and repeat the whole sequence up to
//! [`crate::retry::MAX_TRIES`] times on a bus or CRC error.

/// DS18B20 thermometer.
pub mod thermometer;
pub use thermometer::{Thermometer, ThermometerRequest, ThermometerRoster};

/// DS2438 battery monitor.
pub mod battery;
pub use battery::{BatteryMonitor, BatteryRequest, BatteryRoster, CurrentMode, VoltageInput};

/// DS2450 quad A/D converter.
pub mod adc;
pub use adc::{AdConverter, AdRequest, AdRoster, PortConfig};

/// DS2408 8-channel addressable switch.
pub mod pio;
pub use pio::{PioOutputs, PioRequest};

use std::time::Duration;

use log::warn;

use crate::crc::crc8;
use crate::logstore::{LogSlot, LogStore};
use crate::rom::DeviceKind;
use crate::status::{RequestError, W1Error};
use crate::topology::{ActiveBranch, BranchId, Bus, DeviceId, Side};

/// A sampled value and the time it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Sample {
    /// Raw device value in the family's unit.
    pub value: i32,
    /// Time of sampling.
    pub timestamp: Duration,
}

/// DS2409 coupler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coupler {
    /// Main branch.
    pub main: BranchId,
    /// Auxiliary branch.
    pub aux: BranchId,
    /// Connected branch as last selected.
    pub active: ActiveBranch,
}

impl Coupler {
    /// Coupler owning `main` and `aux`, with the active branch unknown.
    #[must_use]
    pub const fn new(main: BranchId, aux: BranchId) -> Self {
        Self {
            main,
            aux,
            active: ActiveBranch::Unknown,
        }
    }

    /// The branch on `side`.
    #[must_use]
    pub const fn branch(&self, side: Side) -> BranchId {
        match side {
            Side::Main => self.main,
            Side::Aux => self.aux,
        }
    }
}

/// Family tag with the family's device state.
#[derive(Debug, Clone, PartialEq)]
pub enum Family {
    /// DS2409 coupler.
    Coupler(Coupler),
    /// DS18B20 thermometer.
    Thermometer(Thermometer),
    /// DS2438 battery monitor.
    BatteryMonitor(BatteryMonitor),
    /// DS2450 A/D converter.
    AdConverter(AdConverter),
    /// DS2408 outputs.
    PioOutputs(PioOutputs),
}

impl Family {
    /// Fresh state for a device of `kind`. Coupler branches are assigned
    /// when the device joins a network.
    #[must_use]
    pub fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Coupler => Self::Coupler(Coupler::new(BranchId::ROOT, BranchId::ROOT)),
            DeviceKind::Thermometer => Self::Thermometer(Thermometer::default()),
            DeviceKind::BatteryMonitor => Self::BatteryMonitor(BatteryMonitor::default()),
            DeviceKind::AdConverter => Self::AdConverter(AdConverter::default()),
            DeviceKind::PioOutputs => Self::PioOutputs(PioOutputs::default()),
        }
    }

    /// The family tag.
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        match self {
            Self::Coupler(_) => DeviceKind::Coupler,
            Self::Thermometer(_) => DeviceKind::Thermometer,
            Self::BatteryMonitor(_) => DeviceKind::BatteryMonitor,
            Self::AdConverter(_) => DeviceKind::AdConverter,
            Self::PioOutputs(_) => DeviceKind::PioOutputs,
        }
    }
}

/// Scheduling state shared by all devices of a family.
#[derive(Debug, Default)]
pub struct Rosters {
    /// Thermometer queue and conversion state.
    pub thermometers: ThermometerRoster,
    /// Battery monitor queues and busy times.
    pub batteries: BatteryRoster,
    /// A/D converter queue and conversion state.
    pub ad_converters: AdRoster,
}

impl Rosters {
    /// Forgets in-flight work after the transport vanished or a rescan.
    pub fn abandon(&mut self) {
        self.thermometers.abandon();
        self.batteries.abandon();
        self.ad_converters.abandon();
    }
}

/// Length of a memory page read with its CRC-8 byte.
pub const PAGE_READ_LEN: u8 = 9;

/// Checks the CRC-8 of a 9-byte page read and returns its eight data bytes.
///
/// # Errors
///
/// `CrcError` on a bad check byte, `BusError` on a short read.
pub fn check_page(data: &[u8]) -> Result<[u8; 8], W1Error> {
    let Some(bytes) = data.get(..usize::from(PAGE_READ_LEN)) else {
        return Err(W1Error::BusError);
    };
    if crc8(&bytes[..8]) != bytes[8] {
        return Err(W1Error::CrcError);
    }
    let mut page = [0u8; 8];
    page.copy_from_slice(&bytes[..8]);
    Ok(page)
}

/// The log slot of a value stream, allocated on first configuration.
pub(crate) fn log_slot(
    logs: &mut dyn LogStore,
    slot: Option<LogSlot>,
) -> Result<LogSlot, RequestError> {
    match slot {
        Some(slot) => Ok(slot),
        None => logs.allocate_slot().map_err(|error| {
            warn!(target: "w1mult::bus", "no log slot: {error}");
            RequestError::BusError
        }),
    }
}

/// Family initialisation of a device found by a scan.
///
/// A device whose initialisation fails is marked not found.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn init_found(bus: &mut Bus, rosters: &mut Rosters, id: DeviceId) -> Result<(), W1Error> {
    let result = match bus.net().device(id).family.kind() {
        DeviceKind::Coupler => Ok(()),
        DeviceKind::Thermometer => thermometer::init(bus, id),
        DeviceKind::BatteryMonitor => battery::init(bus, &mut rosters.batteries, id),
        DeviceKind::AdConverter => adc::init(bus, &mut rosters.ad_converters, id),
        DeviceKind::PioOutputs => pio::init(bus, id),
    };
    match result {
        Err(error) if error.aborts_pass() => Err(error),
        Err(error) => {
            warn!(
                target: "w1mult::bus",
                "{:?} {} failed to initialise: {error}",
                bus.net().device(id).family.kind(),
                bus.net().device(id).rom
            );
            bus.net_mut().device_mut(id).found = false;
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::check_page;
    use crate::crc::crc8;
    use crate::status::W1Error;

    #[test]
    fn page_crc_is_checked() {
        let mut page = vec![0x91, 0x01, 0x7F, 0x80, 0x7F, 0xFF, 0x0F, 0x10];
        page.push(crc8(&page));
        assert_eq!(check_page(&page).map(|p| p[4]), Ok(0x7F));
        page[0] ^= 1;
        assert_eq!(check_page(&page), Err(W1Error::CrcError));
        assert_eq!(check_page(&page[..4]), Err(W1Error::BusError));
    }
}
