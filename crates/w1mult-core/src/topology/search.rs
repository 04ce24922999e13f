use log::{debug, error, info, warn};

use crate::program::{BusConfig, Program, SEARCH_RESPONSE_LEN};
use crate::rom::Rom;
use crate::status::{StatusCode, W1Error};

use super::bus::failure;
use super::{ActiveBranch, Bus, BranchId, DeviceId};

/// Coupler command that disconnects both of its branches.
pub const ALL_LINES_OFF: u8 = 0x66;

/// Whole-bus scans attempted before a bus or CRC error is reported.
pub const MAX_SCAN_ATTEMPTS: usize = 3;

/// Outcome of a full rescan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Configured devices present on the bus.
    pub found: Vec<DeviceId>,
    /// Configured devices that did not answer.
    pub missing: Vec<DeviceId>,
    /// The root segment reported a short.
    pub root_shorted: bool,
}

/// Seed for the search pass after the one that returned `rom` with
/// `discrepancies`.
///
/// Takes the highest discrepancy bit where `rom` went the 0 way, sets it,
/// keeps the bits below it (the search starts at the least significant bit)
/// and clears the bits above. `None` once every branch of the collision tree
/// has been taken.
#[must_use]
pub const fn next_seed(rom: Rom, discrepancies: u64) -> Option<Rom> {
    let mut pending = discrepancies;
    while pending != 0 {
        let mask = 1u64 << (63 - pending.leading_zeros());
        if rom.0 & mask == 0 {
            return Some(Rom(mask | (rom.0 & (mask - 1))));
        }
        pending &= !mask;
    }
    None
}

/// Broadcasts all-lines-off on `branch` so a search sees only that level.
/// Returns `false` when the branch is empty or unusable.
fn all_lines_off(bus: &mut Bus, branch: BranchId) -> Result<bool, W1Error> {
    let mut program = Program::new();
    bus.address_path(&mut program, branch, true);
    let addressed = program.len();
    program.skip_rom().write_byte(ALL_LINES_OFF).read_bytes(1);
    let completion = bus.run(&program)?;
    match completion.status {
        StatusCode::Ok => match completion.data.first() {
            Some(&(ALL_LINES_OFF | 0xFF)) => {
                let couplers = bus.net().branch(branch).child_couplers.clone();
                for coupler in couplers {
                    bus.net_mut().set_active(coupler, ActiveBranch::Unknown);
                }
                Ok(true)
            }
            other => {
                warn!(target: "w1mult::search", "all lines off on {branch:?} got {other:02x?}");
                Err(W1Error::BusError)
            }
        },
        StatusCode::NoDevicePresent if completion.executed < addressed => {
            debug!(target: "w1mult::search", "{branch:?} is empty");
            Ok(false)
        }
        StatusCode::BusShorted => {
            error!(target: "w1mult::search", "{branch:?} is shorted, not searched");
            Ok(false)
        }
        status => {
            warn!(
                target: "w1mult::search",
                "all lines off on {branch:?} got {status:?} after {} bytes",
                completion.executed
            );
            Err(failure(status))
        }
    }
}

/// Marks a configured device present and prepares its coupler branches.
fn on_found(bus: &mut Bus, id: DeviceId) {
    let net = bus.net_mut();
    let device = net.device_mut(id);
    device.found = true;
    device.sampling = false;
    let branches = net.coupler(id).map(|c| [c.main, c.aux]);
    if let Some(branches) = branches {
        for branch in branches {
            let segment = net.branch_mut(branch);
            segment.needs_work = false;
            segment.shorted = false;
        }
    }
}

/// Discovers the devices directly on `branch` and, through couplers, below
/// it.
///
/// Every ROM found is checked against its CRC-8 and looked up among the
/// devices configured on `branch`; unconfigured ROMs are logged and skipped.
/// Couplers are searched recursively, main branch first, before the search
/// of `branch` continues.
///
/// Returns the configured devices found directly on `branch`.
///
/// # Errors
///
/// `TransportGone`, fatal program errors, and `BusError`/`CrcError`/
/// `Timeout` for a failed search step. A bus error is also reported when
/// the search repeats a ROM.
pub fn search_path(bus: &mut Bus, branch: BranchId) -> Result<Vec<DeviceId>, W1Error> {
    let mut found = Vec::new();
    if !all_lines_off(bus, branch)? {
        return Ok(found);
    }
    let mut seen: Vec<Rom> = Vec::new();
    let mut seed = Rom(0);
    loop {
        let mut program = Program::new();
        bus.address_path(&mut program, branch, true);
        program.search_rom(seed);
        let completion = bus.run(&program)?;
        match completion.status {
            StatusCode::Ok => {}
            StatusCode::NoDevicePresent => break,
            status => return Err(failure(status)),
        }
        let Some(response) = completion.data.get(..SEARCH_RESPONSE_LEN) else {
            warn!(
                target: "w1mult::search",
                "search returned {} bytes",
                completion.data.len()
            );
            return Err(W1Error::BusError);
        };
        let mut rom_bytes = [0u8; 8];
        rom_bytes.copy_from_slice(&response[..8]);
        let mut discrepancy_bytes = [0u8; 8];
        discrepancy_bytes.copy_from_slice(&response[8..]);
        let rom = Rom::from_le_bytes(rom_bytes);
        let discrepancies = u64::from_le_bytes(discrepancy_bytes);
        debug!(target: "w1mult::search", "{branch:?}: rom {rom} discrepancies {discrepancies:#018x}");

        if !rom.crc_valid() {
            warn!(target: "w1mult::search", "rom {rom} fails its CRC");
            return Err(W1Error::CrcError);
        }
        if seen.contains(&rom) {
            warn!(target: "w1mult::search", "search repeated rom {rom}");
            return Err(W1Error::BusError);
        }
        seen.push(rom);

        match bus.net().find_on_branch(rom, branch) {
            Some(id) => {
                debug!(target: "w1mult::search", "rom {rom} found");
                on_found(bus, id);
                found.push(id);
                let branches = bus.net().coupler(id).map(|c| [c.main, c.aux]);
                if let Some(branches) = branches {
                    for child in branches {
                        search_path(bus, child)?;
                    }
                    // The recursion left one of the new coupler's branches on.
                    all_lines_off(bus, branch)?;
                }
            }
            None => match bus.net().branch(branch).owner {
                Some((coupler, side)) => warn!(
                    target: "w1mult::search",
                    "rom {rom} on coupler {} {side:?} branch is not configured",
                    bus.net().device(coupler).rom
                ),
                None => warn!(target: "w1mult::search", "rom {rom} is not configured"),
            },
        }

        match next_seed(rom, discrepancies) {
            Some(next) => seed = next,
            None => break,
        }
    }
    Ok(found)
}

fn scan_once(bus: &mut Bus, config: &BusConfig) -> Result<ScanReport, W1Error> {
    bus.reset_master()?;
    bus.configure(config)?;
    bus.net_mut().reset_for_scan();

    let mut report = ScanReport::default();
    let mut program = Program::new();
    program.reset_normal();
    let completion = bus.run(&program)?;
    match completion.status {
        StatusCode::BusShorted => {
            bus.net_mut().branch_mut(BranchId::ROOT).shorted = true;
            report.root_shorted = true;
            error!(target: "w1mult::search", "main bus is shorted");
        }
        StatusCode::NoDevicePresent => {
            info!(target: "w1mult::search", "no devices on the bus");
        }
        StatusCode::Ok | StatusCode::AlarmingPresencePulse => {
            search_path(bus, BranchId::ROOT)?;
        }
        status => return Err(failure(status)),
    }

    let net = bus.net();
    for id in net.ids() {
        if net.device(id).found {
            report.found.push(id);
        } else {
            warn!(
                target: "w1mult::search",
                "rom {} configured but not found",
                net.device(id).rom
            );
            report.missing.push(id);
        }
    }
    Ok(report)
}

/// Full rescan: resets and configures the bus master, forgets what was
/// known about the bus and searches from the root.
///
/// Bus, CRC and timeout errors repeat the whole scan, up to
/// [`MAX_SCAN_ATTEMPTS`] times in all.
///
/// # Errors
///
/// `TransportGone`, fatal program errors, or the last retryable error once
/// the attempts are used up.
pub fn scan_bus(bus: &mut Bus, config: &BusConfig) -> Result<ScanReport, W1Error> {
    let mut attempt = 1;
    loop {
        match scan_once(bus, config) {
            Ok(report) => {
                info!(
                    target: "w1mult::search",
                    "scan found {} of {} configured devices",
                    report.found.len(),
                    bus.net().len()
                );
                return Ok(report);
            }
            Err(error) if error.is_retryable() && attempt < MAX_SCAN_ATTEMPTS => {
                warn!(target: "w1mult::search", "scan attempt {attempt} failed: {error}");
                attempt += 1;
            }
            Err(error) => {
                if error.is_retryable() {
                    warn!(target: "w1mult::search", "giving up scan after {attempt} attempts: {error}");
                }
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::next_seed;
    use crate::rom::Rom;

    #[test]
    fn no_discrepancies_ends_the_search() {
        assert_eq!(next_seed(Rom(0x1234), 0), None);
    }

    #[test]
    fn highest_unresolved_discrepancy_is_taken() {
        // Discrepancies at bits 1 and 3; the rom went 0 at both.
        let seed = next_seed(Rom(0b1111_0101), 0b1010).expect("more devices");
        assert_eq!(seed, Rom(0b1101));
    }

    #[test]
    fn resolved_discrepancies_are_skipped() {
        // Bit 3 already went 1, so bit 1 is next.
        let seed = next_seed(Rom(0b1001), 0b1010).expect("more devices");
        assert_eq!(seed, Rom(0b0011));
        assert_eq!(next_seed(Rom(0b1011), 0b1010), None);
    }
}
