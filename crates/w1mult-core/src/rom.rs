use std::fmt;

use crate::crc::crc8;

/// Family code of the DS2409 two-branch coupler.
pub const FAMILY_COUPLER: u8 = 0x1F;
/// Family code of the DS18B20 thermometer.
pub const FAMILY_THERMOMETER: u8 = 0x28;
/// Family code of the DS2438 battery monitor.
pub const FAMILY_BATTERY_MONITOR: u8 = 0x26;
/// Family code of the DS2450 quad A/D converter.
pub const FAMILY_AD_CONVERTER: u8 = 0x20;
/// Family code of the DS2408 8-channel addressable switch.
pub const FAMILY_PIO_OUTPUTS: u8 = 0x29;

/// 64-bit ROM id burned into every device.
///
/// Byte 0 (least significant) is the family code, bytes 1-6 the serial
/// number and byte 7 the CRC-8 of bytes 0-6. The id travels little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Rom(pub u64);

impl Rom {
    /// Builds a ROM id with a valid check byte from a family code and a
    /// 48-bit serial number.
    #[must_use]
    pub fn with_crc(family: u8, serial: u64) -> Self {
        let body = u64::from(family) | ((serial & 0xFFFF_FFFF_FFFF) << 8);
        let bytes = body.to_le_bytes();
        let check = crc8(&bytes[..7]);
        Self(body | (u64::from(check) << 56))
    }

    /// Decodes a ROM id from its eight wire bytes.
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Wire bytes of the id.
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Family code byte.
    #[must_use]
    pub const fn family_code(self) -> u8 {
        self.to_le_bytes()[0]
    }

    /// Returns `true` when byte 7 is the CRC-8 of bytes 0-6.
    #[must_use]
    pub fn crc_valid(self) -> bool {
        let bytes = self.to_le_bytes();
        crc8(&bytes[..7]) == bytes[7]
    }

    /// Device kind selected by the family code, if supported.
    #[must_use]
    pub const fn kind(self) -> Option<DeviceKind> {
        DeviceKind::from_family_code(self.family_code())
    }
}

impl fmt::Display for Rom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Closed set of supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum DeviceKind {
    /// DS2409 coupler with switchable main and aux branches.
    Coupler,
    /// DS18B20 thermometer.
    Thermometer,
    /// DS2438 battery monitor.
    BatteryMonitor,
    /// DS2450 quad A/D converter.
    AdConverter,
    /// DS2408 8-channel addressable switch.
    PioOutputs,
}

impl DeviceKind {
    /// Maps a family code to its kind.
    #[must_use]
    pub const fn from_family_code(code: u8) -> Option<Self> {
        match code {
            FAMILY_COUPLER => Some(Self::Coupler),
            FAMILY_THERMOMETER => Some(Self::Thermometer),
            FAMILY_BATTERY_MONITOR => Some(Self::BatteryMonitor),
            FAMILY_AD_CONVERTER => Some(Self::AdConverter),
            FAMILY_PIO_OUTPUTS => Some(Self::PioOutputs),
            _ => None,
        }
    }

    /// Family code of this kind.
    #[must_use]
    pub const fn family_code(self) -> u8 {
        match self {
            Self::Coupler => FAMILY_COUPLER,
            Self::Thermometer => FAMILY_THERMOMETER,
            Self::BatteryMonitor => FAMILY_BATTERY_MONITOR,
            Self::AdConverter => FAMILY_AD_CONVERTER,
            Self::PioOutputs => FAMILY_PIO_OUTPUTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceKind, Rom, FAMILY_THERMOMETER};

    #[test]
    fn with_crc_produces_valid_ids() {
        let rom = Rom::with_crc(FAMILY_THERMOMETER, 0x0000_0615_4CFF);
        assert!(rom.crc_valid());
        assert_eq!(rom.family_code(), FAMILY_THERMOMETER);
        assert_eq!(rom.kind(), Some(DeviceKind::Thermometer));
    }

    #[test]
    fn corrupted_check_byte_is_detected() {
        let rom = Rom::with_crc(FAMILY_THERMOMETER, 42);
        let corrupted = Rom(rom.0 ^ (1 << 60));
        assert!(!corrupted.crc_valid());
    }

    #[test]
    fn wire_bytes_are_little_endian() {
        let rom = Rom(0xA200_0000_01B8_1C02);
        assert_eq!(rom.to_le_bytes()[0], 0x02);
        assert!(rom.crc_valid());
        assert_eq!(Rom::from_le_bytes(rom.to_le_bytes()), rom);
    }

    #[test]
    fn display_is_fixed_width_hex() {
        assert_eq!(Rom(0x1F).to_string(), "0x000000000000001f");
    }

    #[test]
    fn family_codes_roundtrip() {
        for kind in [
            DeviceKind::Coupler,
            DeviceKind::Thermometer,
            DeviceKind::BatteryMonitor,
            DeviceKind::AdConverter,
            DeviceKind::PioOutputs,
        ] {
            assert_eq!(DeviceKind::from_family_code(kind.family_code()), Some(kind));
        }
        assert_eq!(DeviceKind::from_family_code(0x01), None);
    }
}
