//! Simulated bus master and devices.
//!
//! [`SimBus`] executes bus programs against a tree of byte-level device
//! models, the way a bus master with DS2409 couplers would. Handles are
//! cheap clones sharing one bus, so a test can keep one to inspect and
//! inject faults while the engine owns another as its transport.

/// Byte-level device models.
pub mod model;
pub use model::{
    AdConverterModel, BatteryModel, CouplerModel, Model, PioModel, ThermometerModel,
};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::trace;

use crate::config::DeviceConfig;
use crate::program::{BusConfig, StepCode, Transport, TransportReply};
use crate::rom::Rom;
use crate::status::StatusCode;
use crate::topology::Side;

#[derive(Debug)]
struct SimDevice {
    rom: Rom,
    parent: Option<(usize, Side)>,
    present: bool,
    model: Model,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

/// Where the ROM layer of the selected segment stands.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// No reset since the last search.
    Idle,
    /// Reset done; a ROM command may follow.
    RomReady,
    /// These devices take the data bytes.
    Selected(Vec<usize>),
}

#[derive(Debug)]
struct SimState {
    devices: Vec<SimDevice>,
    root_shorted: bool,
    shorts: Vec<(usize, Side)>,
    scope: Option<(usize, Side)>,
    phase: Phase,
    transactions: u64,
    switches: u64,
    fail: Option<(usize, StatusCode)>,
    corrupt: usize,
    gone: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            root_shorted: false,
            shorts: Vec::new(),
            scope: None,
            phase: Phase::Idle,
            transactions: 0,
            switches: 0,
            fail: None,
            corrupt: 0,
            gone: false,
        }
    }
}

fn rom_payload(payload: &[u8]) -> Rom {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(payload);
    Rom::from_le_bytes(bytes)
}

impl SimState {
    fn index(&self, rom: Rom) -> Option<usize> {
        self.devices.iter().position(|d| d.rom == rom)
    }

    /// Returns `true` when device `index` answers on the segment tree rooted
    /// at `scope`.
    fn reachable(&self, index: usize, scope: Option<(usize, Side)>) -> bool {
        if !self.devices[index].present {
            return false;
        }
        let mut at = self.devices[index].parent;
        loop {
            if at == scope {
                return true;
            }
            let Some((coupler, side)) = at else {
                return false;
            };
            let device = &self.devices[coupler];
            if !device.present || device.model.connected() != Some(side) {
                return false;
            }
            at = device.parent;
        }
    }

    fn members(&self) -> Vec<usize> {
        (0..self.devices.len())
            .filter(|&i| self.reachable(i, self.scope))
            .collect()
    }

    fn scope_shorted(&self) -> bool {
        match self.scope {
            None if self.root_shorted => return true,
            Some(branch) if self.shorts.contains(&branch) => return true,
            _ => {}
        }
        self.shorts.iter().any(|&(coupler, side)| {
            self.devices[coupler].model.connected() == Some(side)
                && self.reachable(coupler, self.scope)
        })
    }

    fn select(&mut self, selected: Vec<usize>) {
        for &i in &selected {
            self.devices[i].rx.clear();
            self.devices[i].tx.clear();
        }
        self.phase = Phase::Selected(selected);
    }

    fn reset(&mut self) -> StatusCode {
        self.scope = None;
        self.phase = Phase::Idle;
        if self.scope_shorted() {
            return StatusCode::BusShorted;
        }
        if self.members().is_empty() {
            return StatusCode::NoDevicePresent;
        }
        self.phase = Phase::RomReady;
        StatusCode::Ok
    }

    fn set_path(&mut self, rom: Rom, side: Side) -> StatusCode {
        if self.phase != Phase::RomReady {
            return StatusCode::SequenceError;
        }
        let coupler = self.index(rom).filter(|&i| {
            matches!(self.devices[i].model, Model::Coupler(_)) && self.reachable(i, self.scope)
        });
        let Some(coupler) = coupler else {
            self.phase = Phase::Idle;
            return StatusCode::BusError;
        };
        let before = self.devices[coupler].model.connected();
        let shorted = self.shorts.contains(&(coupler, side));
        if let Model::Coupler(state) = &mut self.devices[coupler].model {
            state.connected = if shorted { None } else { Some(side) };
        }
        if shorted {
            self.phase = Phase::Idle;
            return StatusCode::BusShorted;
        }
        if before != Some(side) {
            self.switches += 1;
        }
        self.scope = Some((coupler, side));
        if self.members().is_empty() {
            self.phase = Phase::Idle;
            return StatusCode::NoDevicePresent;
        }
        StatusCode::Ok
    }

    fn match_rom(&mut self, rom: Rom) -> StatusCode {
        if self.phase != Phase::RomReady {
            return StatusCode::SequenceError;
        }
        let selected = self
            .members()
            .into_iter()
            .filter(|&i| self.devices[i].rom == rom)
            .collect();
        self.select(selected);
        StatusCode::Ok
    }

    fn skip_rom(&mut self) -> StatusCode {
        if self.phase != Phase::RomReady {
            return StatusCode::SequenceError;
        }
        let selected = self.members();
        self.select(selected);
        StatusCode::Ok
    }

    /// One search pass: at every discrepancy the direction is the seed's
    /// bit.
    fn search(&mut self, seed: Rom, data: &mut Vec<u8>) -> StatusCode {
        if self.phase != Phase::RomReady {
            return StatusCode::SequenceError;
        }
        let mut candidates = self.members();
        if candidates.is_empty() {
            self.phase = Phase::Idle;
            return StatusCode::NoDevicePresent;
        }
        let mut rom = 0u64;
        let mut discrepancies = 0u64;
        for bit in 0..64 {
            let mask = 1u64 << bit;
            let ones = candidates.iter().any(|&i| self.devices[i].rom.0 & mask != 0);
            let zeros = candidates.iter().any(|&i| self.devices[i].rom.0 & mask == 0);
            let take_one = if ones && zeros {
                discrepancies |= mask;
                seed.0 & mask != 0
            } else {
                ones
            };
            if take_one {
                rom |= mask;
            }
            candidates.retain(|&i| (self.devices[i].rom.0 & mask != 0) == take_one);
        }
        data.extend_from_slice(&rom.to_le_bytes());
        data.extend_from_slice(&discrepancies.to_le_bytes());
        self.select(candidates);
        StatusCode::Ok
    }

    fn write(&mut self, bytes: &[u8]) -> StatusCode {
        let Phase::Selected(selected) = &self.phase else {
            return StatusCode::SequenceError;
        };
        let selected = selected.clone();
        for &byte in bytes {
            for &i in &selected {
                let device = &mut self.devices[i];
                let before = device.model.connected();
                device.rx.push(byte);
                device.model.on_write(&device.rx, &mut device.tx);
                let after = device.model.connected();
                if after.is_some() && after != before {
                    self.switches += 1;
                }
            }
        }
        StatusCode::Ok
    }

    fn read(&mut self, count: u8, data: &mut Vec<u8>) -> StatusCode {
        let Phase::Selected(selected) = &self.phase else {
            return StatusCode::SequenceError;
        };
        for _ in 0..count {
            let mut byte = 0xFF;
            for &i in selected {
                byte &= self.devices[i].tx.pop_front().unwrap_or(0xFF);
            }
            data.push(byte);
        }
        StatusCode::Ok
    }

    fn step(&mut self, step: StepCode, payload: &[u8], data: &mut Vec<u8>) -> StatusCode {
        match step {
            StepCode::ResetSimple | StepCode::ResetNormal => self.reset(),
            StepCode::SetPathMain => self.set_path(rom_payload(payload), Side::Main),
            StepCode::SetPathAux => self.set_path(rom_payload(payload), Side::Aux),
            StepCode::MatchRom => self.match_rom(rom_payload(payload)),
            StepCode::SearchRom => self.search(rom_payload(payload), data),
            StepCode::SkipRom => self.skip_rom(),
            StepCode::WriteBytes => self.write(payload),
            StepCode::ReadBytes => self.read(payload.first().copied().unwrap_or(0), data),
        }
    }

    fn execute(&mut self, program: &[u8]) -> TransportReply {
        if self.gone {
            return reply(StatusCode::TransportGone, 0, Vec::new());
        }
        self.transactions += 1;
        if let Some((count, status)) = self.fail.take() {
            if count > 1 {
                self.fail = Some((count - 1, status));
            }
            self.phase = Phase::Idle;
            return reply(status, 0, Vec::new());
        }
        let mut data = Vec::new();
        let mut first_read = None;
        let mut at = 0;
        while at < program.len() {
            let start = at;
            let Some(step) = StepCode::from_u8(program[at]) else {
                return reply(StatusCode::ProgramError, start, data);
            };
            let payload_start = at + 1;
            let payload_end = match step {
                StepCode::WriteBytes => match program.get(payload_start) {
                    Some(&count) => payload_start + 1 + usize::from(count),
                    None => return reply(StatusCode::ProgramError, start, data),
                },
                _ => payload_start + step.payload_len(),
            };
            let Some(payload) = program.get(payload_start..payload_end) else {
                return reply(StatusCode::ProgramError, start, data);
            };
            let payload = match step {
                StepCode::WriteBytes => &payload[1..],
                _ => payload,
            };
            if step == StepCode::ReadBytes && first_read.is_none() {
                first_read = Some(data.len());
            }
            let status = self.step(step, payload, &mut data);
            if status != StatusCode::Ok {
                trace!(target: "w1mult::sim", "{step:?} at {start} -> {status:?}");
                return reply(status, start, data);
            }
            at = payload_end;
        }
        if self.corrupt > 0 {
            if let Some(byte) = first_read.and_then(|index| data.get_mut(index)) {
                *byte ^= 0x01;
                self.corrupt -= 1;
            }
        }
        reply(StatusCode::Ok, program.len(), data)
    }
}

const fn reply(status: StatusCode, executed: usize, data: Vec<u8>) -> TransportReply {
    TransportReply {
        status,
        executed,
        data,
    }
}

/// Simulated bus master with a tree of devices behind it.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Rc<RefCell<SimState>>,
}

impl SimBus {
    /// Bus with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus populated with exactly the configured devices, all present.
    #[must_use]
    pub fn from_config(devices: &[DeviceConfig]) -> Self {
        let sim = Self::new();
        for config in devices {
            let parent = config
                .parent_index
                .and_then(|index| devices.get(index))
                .map(|parent| (parent.rom, config.branch));
            sim.add_device(config.rom, parent);
        }
        sim
    }

    /// Adds a present device on the root or on one branch of a coupler
    /// already added. A parent that is not known puts the device on the
    /// root.
    pub fn add_device(&self, rom: Rom, parent: Option<(Rom, Side)>) {
        let mut state = self.state.borrow_mut();
        let parent =
            parent.and_then(|(coupler, side)| state.index(coupler).map(|index| (index, side)));
        state.devices.push(SimDevice {
            rom,
            parent,
            present: true,
            model: Model::for_kind(rom.kind()),
            rx: Vec::new(),
            tx: VecDeque::new(),
        });
    }

    /// Connects or disconnects a device.
    pub fn set_present(&self, rom: Rom, present: bool) {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state.index(rom) {
            state.devices[index].present = present;
        }
    }

    /// Shorts the root (`None`) or one coupler branch.
    pub fn short(&self, at: Option<(Rom, Side)>) {
        let mut state = self.state.borrow_mut();
        match at {
            None => state.root_shorted = true,
            Some((rom, side)) => {
                if let Some(index) = state.index(rom) {
                    state.shorts.push((index, side));
                }
            }
        }
    }

    /// Removes every short.
    pub fn clear_shorts(&self) {
        let mut state = self.state.borrow_mut();
        state.root_shorted = false;
        state.shorts.clear();
    }

    /// Makes the next `count` programs fail with `status` before any step
    /// runs.
    pub fn fail_next(&self, count: usize, status: StatusCode) {
        self.state.borrow_mut().fail = (count > 0).then_some((count, status));
    }

    /// Flips a bit in the first byte read by each of the next `count`
    /// programs that read.
    pub fn corrupt_next(&self, count: usize) {
        self.state.borrow_mut().corrupt = count;
    }

    /// Makes the bus master disappear for good.
    pub fn vanish(&self) {
        self.state.borrow_mut().gone = true;
    }

    /// Programs executed.
    #[must_use]
    pub fn transactions(&self) -> u64 {
        self.state.borrow().transactions
    }

    /// Coupler branch connections made.
    #[must_use]
    pub fn switches(&self) -> u64 {
        self.state.borrow().switches
    }

    /// Connected branch of a coupler.
    #[must_use]
    pub fn coupler_side(&self, rom: Rom) -> Option<Side> {
        let state = self.state.borrow();
        state
            .index(rom)
            .and_then(|index| state.devices[index].model.connected())
    }

    /// Runs `f` on the model of the device with `rom`.
    #[must_use]
    pub fn with_model<R>(&self, rom: Rom, f: impl FnOnce(&mut Model) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        let index = state.index(rom)?;
        Some(f(&mut state.devices[index].model))
    }

    fn update(&self, rom: Rom, f: impl FnOnce(&mut Model)) {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state.index(rom) {
            f(&mut state.devices[index].model);
        }
    }

    /// Sets the temperature a thermometer or battery monitor converts next,
    /// in the device's own unit.
    pub fn set_temperature(&self, rom: Rom, temperature: i16) {
        self.update(rom, |model| match model {
            Model::Thermometer(thermometer) => thermometer.temperature = temperature,
            Model::Battery(battery) => battery.temperature = temperature,
            _ => {}
        });
    }

    /// Sets the voltages a battery monitor converts next.
    pub fn set_voltages(&self, rom: Rom, vad: u16, vdd: u16) {
        self.update(rom, |model| {
            if let Model::Battery(battery) = model {
                battery.vad = vad;
                battery.vdd = vdd;
            }
        });
    }

    /// Sets the inputs an A/D converter converts next.
    pub fn set_ad_inputs(&self, rom: Rom, inputs: [u16; 4]) {
        self.update(rom, |model| {
            if let Model::AdConverter(converter) = model {
                converter.inputs = inputs;
            }
        });
    }

    /// Output latches of an 8-channel switch.
    #[must_use]
    pub fn pio_outputs(&self, rom: Rom) -> Option<u8> {
        self.with_model(rom, |model| match model {
            Model::Pio(pio) => Some(pio.outputs),
            _ => None,
        })
        .flatten()
    }

    /// Configuration register a thermometer holds in EEPROM.
    #[must_use]
    pub fn thermometer_config(&self, rom: Rom) -> Option<u8> {
        self.with_model(rom, |model| match model {
            Model::Thermometer(thermometer) => Some(thermometer.stored_config()),
            _ => None,
        })
        .flatten()
    }
}

impl Transport for SimBus {
    fn reset(&mut self) -> StatusCode {
        let mut state = self.state.borrow_mut();
        if state.gone {
            return StatusCode::TransportGone;
        }
        state.phase = Phase::Idle;
        StatusCode::Ok
    }

    fn configure(&mut self, _config: &BusConfig) -> StatusCode {
        if self.state.borrow().gone {
            StatusCode::TransportGone
        } else {
            StatusCode::Ok
        }
    }

    fn execute(&mut self, program: &[u8]) -> TransportReply {
        self.state.borrow_mut().execute(program)
    }
}
