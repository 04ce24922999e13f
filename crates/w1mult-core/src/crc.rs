//! Dallas/Maxim CRC-8 and CRC-16 checksums used on every wire transaction.

/// Reflected form of the CRC-8 polynomial `x^8 + x^5 + x^4 + 1`.
pub const CRC8_POLY: u8 = 0x8C;

/// Reflected form of the CRC-16 polynomial `x^16 + x^15 + x^2 + 1`.
pub const CRC16_POLY: u16 = 0xA001;

/// Computes the 1-Wire CRC-8 of `data` starting from zero.
///
/// Appending the result to `data` makes the CRC of the whole sequence zero,
/// which is how ROM ids and scratchpads carry their check byte.
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, &byte| crc8_update(crc, byte))
}

/// Feeds one byte into a running CRC-8.
#[must_use]
pub const fn crc8_update(crc: u8, byte: u8) -> u8 {
    let mut crc = crc ^ byte;
    let mut bit = 0;
    while bit < 8 {
        crc = if crc & 1 == 0 {
            crc >> 1
        } else {
            (crc >> 1) ^ CRC8_POLY
        };
        bit += 1;
    }
    crc
}

/// Running CRC-16 accumulator.
///
/// Devices transmit the one's complement of the accumulator, least
/// significant byte first. Callers own the accumulator and feed it the bytes
/// they write and read, then compare against the two bytes the device sent
/// with [`Crc16::matches_inverted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Crc16(u16);

impl Crc16 {
    /// Starts a fresh accumulator at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Starts an accumulator preloaded with `seed`.
    ///
    /// The A/D converter computes the checksum of every byte after the first
    /// in a memory write from the incremented target address.
    #[must_use]
    pub const fn with_seed(seed: u16) -> Self {
        Self(seed)
    }

    /// Feeds one byte.
    pub fn update(&mut self, byte: u8) {
        let mut crc = self.0 ^ u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 == 0 {
                crc >> 1
            } else {
                (crc >> 1) ^ CRC16_POLY
            };
        }
        self.0 = crc;
    }

    /// Feeds a byte slice.
    pub fn update_all(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.update(byte);
        }
    }

    /// Current accumulator value.
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// The two bytes a device sends for this accumulator, in wire order.
    #[must_use]
    pub const fn inverted_bytes(self) -> [u8; 2] {
        (!self.0).to_le_bytes()
    }

    /// Checks the inverted checksum bytes a device sent after the data.
    #[must_use]
    pub const fn matches_inverted(self, lo: u8, hi: u8) -> bool {
        !self.0 == u16::from_le_bytes([lo, hi])
    }
}

/// Computes the CRC-16 of `data` starting from zero.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update_all(data);
    crc.value()
}

#[cfg(test)]
mod tests {
    use super::{crc16, crc8, Crc16};

    #[test]
    fn crc8_matches_datasheet_rom_example() {
        // ROM 0x A2 00 00 00 01 B8 1C 02, family 0x02, from Maxim app note 27.
        let rom = [0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00];
        assert_eq!(crc8(&rom), 0xA2);
    }

    #[test]
    fn crc8_of_data_plus_check_byte_is_zero() {
        let mut data = vec![0x28, 0xFF, 0x4C, 0x06, 0x15, 0x14, 0x02];
        data.push(crc8(&data));
        assert_eq!(crc8(&data), 0);
    }

    #[test]
    fn crc16_check_value() {
        // CRC-16/ARC check value over ASCII "123456789".
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn seeded_accumulator_differs_from_zero_start() {
        let mut seeded = Crc16::with_seed(0x0009);
        seeded.update(0x40);
        let mut plain = Crc16::new();
        plain.update(0x40);
        assert_ne!(seeded.value(), plain.value());
    }

    #[test]
    fn inverted_bytes_are_accepted_by_matches_inverted() {
        let mut crc = Crc16::new();
        crc.update_all(&[0x3C, 0x0F, 0x00]);
        let [lo, hi] = crc.inverted_bytes();
        assert!(crc.matches_inverted(lo, hi));
        assert!(!crc.matches_inverted(lo ^ 1, hi));
    }
}
