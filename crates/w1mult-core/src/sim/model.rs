//! Byte-level device models.
//!
//! Each model sees the bytes written to it since it was last selected and
//! queues the bytes it will answer with. Conversions complete at once.

use std::collections::VecDeque;

use crate::crc::{crc8, Crc16};
use crate::rom::DeviceKind;
use crate::topology::Side;

/// DS2409 coupler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CouplerModel {
    /// Branch currently connected, if any.
    pub connected: Option<Side>,
}

/// DS18B20 thermometer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThermometerModel {
    /// Temperature the next conversion reads, in 1/16 degree.
    pub temperature: i16,
    scratchpad: [u8; 8],
    eeprom: [u8; 3],
}

impl Default for ThermometerModel {
    fn default() -> Self {
        Self {
            temperature: 0x0190,
            scratchpad: [0x50, 0x05, 0x4B, 0x46, 0x7F, 0xFF, 0x0C, 0x10],
            eeprom: [0x4B, 0x46, 0x7F],
        }
    }
}

impl ThermometerModel {
    /// Configuration register as copied to EEPROM.
    #[must_use]
    pub const fn stored_config(&self) -> u8 {
        self.eeprom[2]
    }

    fn on_write(&mut self, rx: &[u8], tx: &mut VecDeque<u8>) {
        match *rx {
            [0x44] => {
                let undefined = 3 - ((self.scratchpad[4] >> 5) & 0x03);
                let value = self.temperature & !((1i16 << undefined) - 1);
                self.scratchpad[..2].copy_from_slice(&value.to_le_bytes());
            }
            [0x4E, high, low, config] => {
                self.scratchpad[2] = high;
                self.scratchpad[3] = low;
                self.scratchpad[4] = (config & 0x60) | 0x1F;
            }
            [0xBE] => {
                tx.extend(self.scratchpad);
                tx.push_back(crc8(&self.scratchpad));
            }
            [0x48] => self.eeprom.copy_from_slice(&self.scratchpad[2..5]),
            [0xB8] => self.scratchpad[2..5].copy_from_slice(&self.eeprom),
            _ => {}
        }
    }
}

/// DS2438 battery monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryModel {
    /// Temperature in 1/32 degree.
    pub temperature: i16,
    /// VAD pin voltage in 10 mV.
    pub vad: u16,
    /// Supply voltage in 10 mV.
    pub vdd: u16,
    /// Current register value.
    pub current: i16,
    memory: [[u8; 8]; 8],
    scratchpad: [[u8; 8]; 8],
}

impl Default for BatteryModel {
    fn default() -> Self {
        let mut memory = [[0u8; 8]; 8];
        memory[0][0] = 0x0F;
        Self {
            temperature: 0x02A0,
            vad: 250,
            vdd: 500,
            current: 0,
            memory,
            scratchpad: [[0u8; 8]; 8],
        }
    }
}

impl BatteryModel {
    /// Stored contents of a memory page.
    #[must_use]
    pub fn page(&self, page: u8) -> [u8; 8] {
        self.memory[usize::from(page & 7)]
    }

    fn on_write(&mut self, rx: &[u8], tx: &mut VecDeque<u8>) {
        match *rx {
            [0xB8, page] => {
                let page = usize::from(page & 7);
                if page == 0 {
                    self.memory[0][5..7].copy_from_slice(&self.current.to_le_bytes());
                }
                self.scratchpad[page] = self.memory[page];
            }
            [0xBE, page] => {
                let page = &self.scratchpad[usize::from(page & 7)];
                tx.extend(*page);
                tx.push_back(crc8(page));
            }
            [0x4E, page, ref data @ ..] if data.len() == 8 => {
                let page = usize::from(page & 7);
                if page == 0 {
                    let pad = &mut self.scratchpad[0];
                    pad[0] = (pad[0] & !0x0F) | (data[0] & 0x0F);
                    pad[7] = data[7];
                } else {
                    self.scratchpad[page].copy_from_slice(data);
                }
            }
            [0x48, page] => {
                let page = usize::from(page & 7);
                if page == 0 {
                    let pad = self.scratchpad[0];
                    self.memory[0][0] = (self.memory[0][0] & !0x0F) | (pad[0] & 0x0F);
                    self.memory[0][7] = pad[7];
                } else {
                    self.memory[page] = self.scratchpad[page];
                }
            }
            [0x44] => {
                let raw = self.temperature.wrapping_shl(3);
                self.memory[0][1..3].copy_from_slice(&raw.to_le_bytes());
            }
            [0xB4] => {
                let volts = if self.memory[0][0] & 0x08 == 0 {
                    self.vad
                } else {
                    self.vdd
                };
                self.memory[0][3..5].copy_from_slice(&volts.to_le_bytes());
            }
            _ => {}
        }
    }
}

/// Writing here clears the power-on reset flags.
const CALIBRATION_ADDRESS: usize = 0x1C;

/// DS2450 quad A/D converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdConverterModel {
    /// Input voltages, full scale 0xFFFF.
    pub inputs: [u16; 4],
    memory: [u8; 32],
}

impl Default for AdConverterModel {
    fn default() -> Self {
        let mut memory = [0u8; 32];
        for port in 0..4 {
            memory[8 + port * 2] = 0x08;
            memory[9 + port * 2] = 0x80;
        }
        Self {
            inputs: [0; 4],
            memory,
        }
    }
}

impl AdConverterModel {
    /// Memory byte at `address`.
    #[must_use]
    pub fn memory(&self, address: u8) -> u8 {
        self.memory.get(usize::from(address)).copied().unwrap_or(0xFF)
    }

    fn store(&mut self, address: usize, byte: u8) -> u8 {
        if let Some(cell) = self.memory.get_mut(address) {
            *cell = byte;
        }
        if address == CALIBRATION_ADDRESS {
            for high in self.memory[8..16].iter_mut().skip(1).step_by(2) {
                *high &= !0x80;
            }
        }
        self.memory.get(address).copied().unwrap_or(0xFF)
    }

    fn convert(&mut self) {
        for port in 0..4 {
            let control = self.memory[8 + port * 2];
            if control & 0x80 != 0 {
                continue;
            }
            let bits = match control & 0x0F {
                0 => 16,
                bits => u32::from(bits),
            };
            let value = self.inputs[port] & u16::MAX.wrapping_shl(16 - bits);
            self.memory[port * 2..port * 2 + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn on_write(&mut self, rx: &[u8], tx: &mut VecDeque<u8>) {
        match *rx {
            [0xAA, low, high] => {
                let start = usize::from(low);
                let end = (start | 7) + 1;
                let mut crc = Crc16::new();
                crc.update_all(&[0xAA, low, high]);
                for address in start..end {
                    let byte = self.memory.get(address).copied().unwrap_or(0xFF);
                    crc.update(byte);
                    tx.push_back(byte);
                }
                tx.extend(crc.inverted_bytes());
            }
            [0x55, low, high, byte] => {
                let mut crc = Crc16::new();
                crc.update_all(&[0x55, low, high, byte]);
                let echo = self.store(usize::from(low), byte);
                tx.extend(crc.inverted_bytes());
                tx.push_back(echo);
            }
            [0x55, low, _, _, ref rest @ ..] => {
                let Some(&byte) = rest.last() else {
                    return;
                };
                let address = usize::from(low) + rest.len();
                let mut crc = Crc16::with_seed(u16::try_from(address).unwrap_or(u16::MAX));
                crc.update(byte);
                let echo = self.store(address, byte);
                tx.extend(crc.inverted_bytes());
                tx.push_back(echo);
            }
            [0x3C, mask, preset] => {
                let mut crc = Crc16::new();
                crc.update_all(&[0x3C, mask, preset]);
                tx.extend(crc.inverted_bytes());
                self.convert();
            }
            _ => {}
        }
    }
}

/// DS2408 8-channel switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioModel {
    /// Output latch state.
    pub outputs: u8,
}

impl Default for PioModel {
    fn default() -> Self {
        Self { outputs: 0xFF }
    }
}

impl PioModel {
    fn on_write(&mut self, rx: &[u8], tx: &mut VecDeque<u8>) {
        if let [0x5A, value, complement] = *rx {
            if complement == !value {
                self.outputs = value;
                tx.extend([0xAA, value]);
            } else {
                tx.push_back(0xFF);
            }
        }
    }
}

/// Simulated device of any family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Model {
    /// Coupler.
    Coupler(CouplerModel),
    /// Thermometer.
    Thermometer(ThermometerModel),
    /// Battery monitor.
    Battery(BatteryModel),
    /// A/D converter.
    AdConverter(AdConverterModel),
    /// 8-channel switch.
    Pio(PioModel),
    /// A device of an unsupported family; answers the ROM layer only.
    Inert,
}

impl Model {
    /// Power-on model for a family.
    #[must_use]
    pub fn for_kind(kind: Option<DeviceKind>) -> Self {
        match kind {
            Some(DeviceKind::Coupler) => Self::Coupler(CouplerModel::default()),
            Some(DeviceKind::Thermometer) => Self::Thermometer(ThermometerModel::default()),
            Some(DeviceKind::BatteryMonitor) => Self::Battery(BatteryModel::default()),
            Some(DeviceKind::AdConverter) => Self::AdConverter(AdConverterModel::default()),
            Some(DeviceKind::PioOutputs) => Self::Pio(PioModel::default()),
            None => Self::Inert,
        }
    }

    /// Connected branch of a coupler.
    #[must_use]
    pub const fn connected(&self) -> Option<Side> {
        match self {
            Self::Coupler(coupler) => coupler.connected,
            _ => None,
        }
    }

    /// Handles the latest byte written, `rx` holding every byte since the
    /// device was selected.
    pub(super) fn on_write(&mut self, rx: &[u8], tx: &mut VecDeque<u8>) {
        match self {
            Self::Coupler(coupler) => match *rx {
                [0x66] => {
                    coupler.connected = None;
                    tx.push_back(0x66);
                }
                [0xA5] => {
                    coupler.connected = Some(Side::Main);
                    tx.push_back(0xA5);
                }
                _ => {}
            },
            Self::Thermometer(model) => model.on_write(rx, tx),
            Self::Battery(model) => model.on_write(rx, tx),
            Self::AdConverter(model) => model.on_write(rx, tx),
            Self::Pio(model) => model.on_write(rx, tx),
            Self::Inert => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdConverterModel, BatteryModel, Model, ThermometerModel};
    use crate::crc::{crc8, Crc16};
    use crate::topology::Side;
    use std::collections::VecDeque;

    fn feed(model: &mut Model, bytes: &[u8]) -> Vec<u8> {
        let mut rx = Vec::new();
        let mut tx = VecDeque::new();
        for &byte in bytes {
            rx.push(byte);
            model.on_write(&rx, &mut tx);
        }
        tx.into_iter().collect()
    }

    #[test]
    fn thermometer_converts_at_configured_resolution() {
        let mut model = Model::Thermometer(ThermometerModel {
            temperature: 0x0197,
            ..ThermometerModel::default()
        });
        feed(&mut model, &[0x4E, 0x7F, 0x80, 0x1F]);
        feed(&mut model, &[0x44]);
        let pad = feed(&mut model, &[0xBE]);
        assert_eq!(pad.len(), 9);
        assert_eq!(i16::from_le_bytes([pad[0], pad[1]]), 0x0190);
        assert_eq!(pad[4], 0x1F);
        assert_eq!(crc8(&pad[..8]), pad[8]);
    }

    #[test]
    fn coupler_answers_switch_commands() {
        let mut model = Model::Coupler(super::CouplerModel {
            connected: Some(Side::Aux),
        });
        assert_eq!(feed(&mut model, &[0xA5]), vec![0xA5]);
        assert_eq!(model.connected(), Some(Side::Main));
        assert_eq!(feed(&mut model, &[0x66]), vec![0x66]);
        assert_eq!(model.connected(), None);
    }

    #[test]
    fn battery_page_zero_keeps_read_only_bytes() {
        let mut model = Model::Battery(BatteryModel::default());
        feed(&mut model, &[0x4E, 0, 0x0B, 1, 2, 3, 4, 5, 6, 0x42]);
        feed(&mut model, &[0x48, 0]);
        if let Model::Battery(battery) = &model {
            let page = battery.page(0);
            assert_eq!(page[0] & 0x0F, 0x0B);
            assert_eq!(page[7], 0x42);
            assert_eq!(page[1], 0);
        }
    }

    #[test]
    fn ad_converter_echoes_writes_with_running_crc() {
        let mut model = Model::AdConverter(AdConverterModel::default());
        let reply = feed(&mut model, &[0x55, 0x08, 0x00, 0x0C, 0x01]);
        let mut first = Crc16::new();
        first.update_all(&[0x55, 0x08, 0x00, 0x0C]);
        let mut second = Crc16::with_seed(0x09);
        second.update(0x01);
        let mut expected = first.inverted_bytes().to_vec();
        expected.push(0x0C);
        expected.extend(second.inverted_bytes());
        expected.push(0x01);
        assert_eq!(reply, expected);
    }
}
