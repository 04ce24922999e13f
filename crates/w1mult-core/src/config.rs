//! Static bus topology configuration.

use thiserror::Error;

use crate::devices::Family;
use crate::rom::{DeviceKind, Rom};
use crate::topology::{BranchId, DeviceId, Network, Side};

/// Most devices a bus may be configured with.
pub const MAX_DEVICES: usize = 50;

/// One configured device. Devices are listed parents first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct DeviceConfig {
    /// Position in the list.
    pub index: usize,
    /// Index of the coupler this device hangs off; `None` for the root.
    pub parent_index: Option<usize>,
    /// Coupler branch the device is on. Ignored for root devices.
    pub branch: Side,
    /// ROM id.
    pub rom: Rom,
}

/// A topology configuration that cannot describe a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An entry's index does not match its position.
    #[error("device at position {position} has index {index}")]
    IndexOutOfSequence {
        /// Position in the list.
        position: usize,
        /// Index it claims.
        index: usize,
    },
    /// A parent index refers to the entry itself or a later one.
    #[error("device {index} names parent {parent}, which is not defined before it")]
    ForwardParent {
        /// The entry.
        index: usize,
        /// The parent it names.
        parent: usize,
    },
    /// A parent index refers to something other than a coupler.
    #[error("device {index} names parent {parent}, which is not a coupler")]
    ParentNotCoupler {
        /// The entry.
        index: usize,
        /// The parent it names.
        parent: usize,
    },
    /// The family code is not one of the supported families.
    #[error("device {index} has unsupported family code {code:#04x}")]
    UnsupportedFamily {
        /// The entry.
        index: usize,
        /// Its family code.
        code: u8,
    },
    /// Two entries share a ROM id.
    #[error("device {index} repeats ROM {rom}")]
    DuplicateRom {
        /// The later entry.
        index: usize,
        /// The repeated id.
        rom: Rom,
    },
    /// More than [`MAX_DEVICES`] entries.
    #[error("{count} devices configured, at most {MAX_DEVICES} supported")]
    TooManyDevices {
        /// Entries given.
        count: usize,
    },
}

impl Network {
    /// Builds the device and branch arenas from a configuration list.
    ///
    /// # Errors
    ///
    /// The first entry that breaks a rule, as a [`ConfigError`].
    pub fn from_config(devices: &[DeviceConfig]) -> Result<Self, ConfigError> {
        if devices.len() > MAX_DEVICES {
            return Err(ConfigError::TooManyDevices {
                count: devices.len(),
            });
        }
        let mut net = Self::new();
        for (position, config) in devices.iter().enumerate() {
            let index = config.index;
            if index != position {
                return Err(ConfigError::IndexOutOfSequence { position, index });
            }
            let code = config.rom.family_code();
            let Some(kind) = DeviceKind::from_family_code(code) else {
                return Err(ConfigError::UnsupportedFamily { index, code });
            };
            if net.find(config.rom).is_some() {
                return Err(ConfigError::DuplicateRom {
                    index,
                    rom: config.rom,
                });
            }
            let parent = match config.parent_index {
                None => BranchId::ROOT,
                Some(parent) if parent >= index => {
                    return Err(ConfigError::ForwardParent { index, parent });
                }
                Some(parent) => net
                    .coupler_branch(DeviceId(parent), config.branch)
                    .ok_or(ConfigError::ParentNotCoupler { index, parent })?,
            };
            net.push_device(config.rom, parent, Family::for_kind(kind));
        }
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, DeviceConfig, MAX_DEVICES};
    use crate::rom::Rom;
    use crate::topology::{BranchId, DeviceId, Network, Side};

    fn entry(index: usize, parent_index: Option<usize>, branch: Side, family: u8) -> DeviceConfig {
        DeviceConfig {
            index,
            parent_index,
            branch,
            rom: Rom::with_crc(family, u64::try_from(index).unwrap() + 1),
        }
    }

    #[test]
    fn devices_hang_off_the_named_coupler_branch() {
        let net = Network::from_config(&[
            entry(0, None, Side::Main, 0x1F),
            entry(1, Some(0), Side::Aux, 0x28),
            entry(2, Some(0), Side::Main, 0x29),
        ])
        .expect("valid configuration");

        assert_eq!(net.len(), 3);
        let aux = net
            .coupler_branch(DeviceId(0), Side::Aux)
            .expect("coupler branch");
        assert_eq!(net.device(DeviceId(1)).parent, aux);
        assert_eq!(net.branch(BranchId::ROOT).child_couplers, vec![DeviceId(0)]);
        assert!(net.ids().all(|id| !net.device(id).found));
    }

    #[test]
    fn rules_are_enforced() {
        assert_eq!(
            Network::from_config(&[entry(1, None, Side::Main, 0x28)]),
            Err(ConfigError::IndexOutOfSequence {
                position: 0,
                index: 1
            })
        );
        assert_eq!(
            Network::from_config(&[entry(0, Some(0), Side::Main, 0x28)]),
            Err(ConfigError::ForwardParent {
                index: 0,
                parent: 0
            })
        );
        assert_eq!(
            Network::from_config(&[
                entry(0, None, Side::Main, 0x28),
                entry(1, Some(0), Side::Main, 0x28),
            ]),
            Err(ConfigError::ParentNotCoupler {
                index: 1,
                parent: 0
            })
        );
        assert_eq!(
            Network::from_config(&[entry(0, None, Side::Main, 0x10)]),
            Err(ConfigError::UnsupportedFamily {
                index: 0,
                code: 0x10
            })
        );
        let mut twin = entry(1, None, Side::Main, 0x28);
        twin.rom = entry(0, None, Side::Main, 0x28).rom;
        assert!(matches!(
            Network::from_config(&[entry(0, None, Side::Main, 0x28), twin]),
            Err(ConfigError::DuplicateRom { index: 1, .. })
        ));
    }

    #[test]
    fn device_count_is_bounded() {
        let devices: Vec<_> = (0..=MAX_DEVICES)
            .map(|i| entry(i, None, Side::Main, 0x28))
            .collect();
        assert_eq!(
            Network::from_config(&devices),
            Err(ConfigError::TooManyDevices {
                count: MAX_DEVICES + 1
            })
        );
        assert!(Network::from_config(&devices[..MAX_DEVICES]).is_ok());
    }
}
