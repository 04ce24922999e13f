use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use w1mult_core::{BusConfig, DeviceConfig, Request, Rom, Side};

/// Contents of the configuration file.
///
/// ```json
/// {
///   "devices": [
///     { "rom": "0x1e0000017a2b011f" },
///     { "rom": "0xdc0000031f8c0228", "parentIndex": 0, "branch": "aux" }
///   ],
///   "requests": [
///     { "index": 1, "request": { "thermometer": { "configure":
///       { "log2": 0, "resolution": 4, "hysteresis": 0 } } } }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DaemonConfig {
    /// Devices, parents first.
    pub devices: Vec<DeviceEntry>,
    /// Requests issued once the bus is up.
    #[serde(default)]
    pub requests: Vec<InitialRequest>,
    /// Electrical parameters applied on every rescan.
    #[serde(default)]
    pub bus: BusConfig,
    /// Contents of the simulated bus.
    #[serde(default)]
    pub simulation: Simulation,
}

/// One device line of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceEntry {
    /// ROM id in hex, most significant byte (the CRC) first.
    pub rom: String,
    /// Index of the parent coupler, or -1 for the root segment.
    #[serde(default = "root_parent")]
    pub parent_index: i64,
    /// Coupler branch. Ignored on the root segment.
    #[serde(default = "main_branch")]
    pub branch: Side,
}

const fn root_parent() -> i64 {
    -1
}

const fn main_branch() -> Side {
    Side::Main
}

/// A request applied to one device at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitialRequest {
    /// Configured index of the device.
    pub index: usize,
    /// The request.
    pub request: Request,
}

/// What the simulated bus holds beyond the configured devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Simulation {
    /// Configured devices that do not answer.
    #[serde(default)]
    pub absent: Vec<usize>,
    /// Unconfigured ROMs wired to the root segment.
    #[serde(default)]
    pub strangers: Vec<String>,
    /// Initial readings of configured devices.
    #[serde(default)]
    pub readings: Vec<SimReading>,
}

/// Simulated readings of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SimReading {
    /// Configured index of the device.
    pub index: usize,
    /// Raw temperature register.
    #[serde(default)]
    pub temperature: Option<i16>,
    /// Battery monitor `[vad, vdd]` in 10 mV units.
    #[serde(default)]
    pub voltages: Option<[u16; 2]>,
    /// A/D input levels, full scale 0xFFFF.
    #[serde(default)]
    pub inputs: Option<[u16; 4]>,
}

/// Parses a ROM id written as 16 hex digits, with or without a `0x` prefix.
///
/// # Errors
///
/// Fails when the text is not 16 hex digits or the CRC byte does not match.
pub fn parse_rom(text: &str) -> Result<Rom> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    ensure!(digits.len() == 16, "rom {text:?} must have 16 hex digits");
    let value = u64::from_str_radix(digits, 16).with_context(|| format!("rom {text:?}"))?;
    let rom = Rom(value);
    ensure!(rom.crc_valid(), "rom {text:?} has a bad CRC byte");
    Ok(rom)
}

impl DaemonConfig {
    /// Topology handed to the engine.
    ///
    /// # Errors
    ///
    /// Fails on a malformed ROM or a parent index below -1. Structural checks
    /// are left to the engine.
    pub fn device_configs(&self) -> Result<Vec<DeviceConfig>> {
        self.devices
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let rom = parse_rom(&entry.rom).with_context(|| format!("device {index}"))?;
                let parent_index = match entry.parent_index {
                    -1 => None,
                    parent => Some(usize::try_from(parent).with_context(|| {
                        format!("device {index}: parent index {parent} is not -1 or a device")
                    })?),
                };
                Ok(DeviceConfig {
                    index,
                    parent_index,
                    branch: entry.branch,
                    rom,
                })
            })
            .collect()
    }

    /// Parsed ROMs of [`Simulation::strangers`].
    ///
    /// # Errors
    ///
    /// Fails on a malformed ROM.
    pub fn stranger_roms(&self) -> Result<Vec<Rom>> {
        self.simulation
            .strangers
            .iter()
            .map(|text| parse_rom(text).context("simulated stranger"))
            .collect()
    }
}

/// Parses a configuration from JSON text.
///
/// # Errors
///
/// Fails on malformed JSON, unknown fields or an empty device list.
pub fn parse(text: &str) -> Result<DaemonConfig> {
    let config: DaemonConfig = serde_json::from_str(text).context("malformed configuration")?;
    if config.devices.is_empty() {
        bail!("configuration lists no devices");
    }
    Ok(config)
}

/// Reads and parses the configuration file at `path`.
///
/// # Errors
///
/// Fails when the file cannot be read or does not parse.
pub fn load(path: &Path) -> Result<DaemonConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use w1mult_core::FAMILY_THERMOMETER;

    #[test]
    fn rom_accepts_both_spellings() {
        let rom = Rom::with_crc(FAMILY_THERMOMETER, 0x0003_1F8C_0228);
        let text = format!("{:016x}", rom.0);
        assert_eq!(parse_rom(&text).expect("bare hex"), rom);
        assert_eq!(parse_rom(&format!("0x{text}")).expect("prefixed"), rom);
        assert_eq!(parse_rom(&rom.to_string()).expect("displayed form"), rom);
    }

    #[test]
    fn rom_with_a_bad_crc_is_rejected() {
        let rom = Rom::with_crc(FAMILY_THERMOMETER, 0x42);
        let broken = format!("{:016x}", rom.0 ^ 0x0100);
        assert!(parse_rom(&broken).is_err());
        assert!(parse_rom("0x28").is_err());
        assert!(parse_rom("zz00000000000028").is_err());
    }

    #[test]
    fn parent_defaults_to_the_root_main_branch() {
        let rom = Rom::with_crc(FAMILY_THERMOMETER, 7);
        let config = parse(&format!(r#"{{ "devices": [ {{ "rom": "{rom}" }} ] }}"#))
            .expect("valid configuration");
        let devices = config.device_configs().expect("valid devices");
        assert_eq!(
            devices,
            vec![DeviceConfig {
                index: 0,
                parent_index: None,
                branch: Side::Main,
                rom,
            }]
        );
        assert_eq!(config.bus, BusConfig::default());
    }

    #[test]
    fn parent_below_minus_one_is_rejected() {
        let rom = Rom::with_crc(FAMILY_THERMOMETER, 7);
        let config = parse(&format!(
            r#"{{ "devices": [ {{ "rom": "{rom}", "parentIndex": -2 }} ] }}"#
        ))
        .expect("valid json");
        assert!(config.device_configs().is_err());
    }

    #[test]
    fn unknown_fields_and_empty_lists_are_rejected() {
        assert!(parse(r#"{ "devices": [], "extra": 1 }"#).is_err());
        assert!(parse(r#"{ "devices": [] }"#).is_err());
    }
}
