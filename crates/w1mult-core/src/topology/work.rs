//! Work passes over the devices marked for sampling.
//!
//! A pass first switches every coupler that serves exactly one needed
//! branch, does the work on the whole active tree, and only then visits the
//! inactive branches that still need work, switching each of them once.

use log::{debug, warn};

use crate::program::{PostAction, Program};
use crate::status::{StatusCode, W1Error};

use super::bus::DIRECT_ON_MAIN;
use super::{ActiveBranch, Bus, BranchId, DeviceId, Side};

/// Work done once per active branch of a pass.
///
/// On entry `branch` is electrically reachable. Implementations that
/// broadcast use [`Bus::ensure_branch_smart_reset`] to confine the command
/// to the branch.
pub trait BranchWork {
    /// Performs the work on `branch`.
    ///
    /// # Errors
    ///
    /// Errors that abort the pass (see [`W1Error::aborts_pass`]) end it;
    /// others are logged and the pass moves on.
    fn on_branch(&mut self, bus: &mut Bus, branch: BranchId) -> Result<(), W1Error>;
}

/// Branch work that addresses every marked device individually.
#[derive(Debug, Clone, Copy)]
pub struct EachDevice<F>(pub F);

impl<F> EachDevice<F>
where
    F: FnMut(&mut Bus, DeviceId) -> Result<(), W1Error>,
{
    /// Wraps a per-device work function.
    pub const fn new(work: F) -> Self {
        Self(work)
    }
}

impl<F> BranchWork for EachDevice<F>
where
    F: FnMut(&mut Bus, DeviceId) -> Result<(), W1Error>,
{
    fn on_branch(&mut self, bus: &mut Bus, branch: BranchId) -> Result<(), W1Error> {
        do_each(bus, branch, &mut self.0)
    }
}

fn found_couplers(bus: &Bus, branch: BranchId) -> Vec<DeviceId> {
    let net = bus.net();
    net.branch(branch)
        .child_couplers
        .iter()
        .copied()
        .filter(|&id| net.device(id).found)
        .collect()
}

fn wants_work(bus: &Bus, branch: BranchId) -> bool {
    let segment = bus.net().branch(branch);
    segment.needs_work && !segment.shorted
}

fn report_switch(bus: &Bus, coupler: DeviceId, side: Side, status: StatusCode) {
    if status != StatusCode::Ok {
        warn!(
            target: "w1mult::doall",
            "switching coupler {} to {side:?} got {status:?}",
            bus.net().device(coupler).rom
        );
    }
}

/// Connects the main branch of `coupler` with the direct-on-main command.
fn direct_on_main(bus: &mut Bus, branch: BranchId, coupler: DeviceId) -> Result<(), W1Error> {
    debug!(
        target: "w1mult::doall",
        "direct-on main of coupler {}",
        bus.net().device(coupler).rom
    );
    let mut program = Program::new();
    bus.ensure_branch_reset(&mut program, branch);
    program
        .match_rom(bus.net().device(coupler).rom)
        .write_byte(DIRECT_ON_MAIN);
    let reply = program.response_len();
    program
        .read_bytes(1)
        .post(PostAction::DirectOnMain { coupler, reply });
    let status = bus.run(&program)?.status;
    report_switch(bus, coupler, Side::Main, status);
    Ok(())
}

/// Connects one branch of `coupler` with a smart-on. Returns the status.
fn smart_on(
    bus: &mut Bus,
    branch: BranchId,
    coupler: DeviceId,
    side: Side,
) -> Result<StatusCode, W1Error> {
    debug!(
        target: "w1mult::doall",
        "smart-on {side:?} of coupler {}",
        bus.net().device(coupler).rom
    );
    let Some(target) = bus.net().coupler_branch(coupler, side) else {
        return Ok(StatusCode::BusError);
    };
    let mut program = Program::new();
    bus.ensure_branch_reset(&mut program, branch);
    program
        .set_path(bus.net().device(coupler).rom, side)
        .post(PostAction::SmartOn(target));
    let status = bus.run(&program)?.status;
    report_switch(bus, coupler, side, status);
    Ok(status)
}

/// Switches couplers below `branch` where doing so helps and costs nothing
/// later: a coupler with exactly one needed branch is switched to it, a
/// coupler with both needed stays where it is (main when unknown). Recurses
/// into whichever branch ends up active.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn activate_needed_branches(bus: &mut Bus, branch: BranchId) -> Result<(), W1Error> {
    for coupler in found_couplers(bus, branch) {
        let Some(state) = bus.net().coupler(coupler).copied() else {
            continue;
        };
        let main = wants_work(bus, state.main);
        let aux = wants_work(bus, state.aux);
        debug!(
            target: "w1mult::doall",
            "coupler {} main {main} aux {aux} active {:?}",
            bus.net().device(coupler).rom,
            state.active
        );
        match (main, aux, state.active) {
            (false, false, _) => continue,
            (true, false, ActiveBranch::Aux | ActiveBranch::Unknown)
            | (true, true, ActiveBranch::Unknown) => direct_on_main(bus, branch, coupler)?,
            (false, true, ActiveBranch::Main | ActiveBranch::Unknown) => {
                smart_on(bus, branch, coupler, Side::Aux)?;
            }
            _ => {}
        }
        if let Some(active) = bus.net().active_branch(coupler) {
            activate_needed_branches(bus, active)?;
        }
    }
    Ok(())
}

/// Services the inactive branches under `branch` that still need work,
/// after the active tree is done. Each such branch costs one switch.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn finish_work<W>(bus: &mut Bus, branch: BranchId, work: &mut W) -> Result<(), W1Error>
where
    W: BranchWork + ?Sized,
{
    for coupler in found_couplers(bus, branch) {
        let Some(side) = bus.net().active(coupler).side() else {
            continue;
        };
        let Some(active) = bus.net().coupler_branch(coupler, side) else {
            continue;
        };
        if bus.net().branch(active).needs_work {
            finish_work(bus, active, work)?;
        }
        let other_side = side.other();
        let Some(other) = bus.net().coupler_branch(coupler, other_side) else {
            continue;
        };
        if !wants_work(bus, other) {
            continue;
        }
        match smart_on(bus, branch, coupler, other_side)? {
            StatusCode::Ok => {
                bus.mark_reset(other);
                do_all(bus, other, work)?;
            }
            _ => bus.net_mut().clear_work_below(other),
        }
    }
    bus.net_mut().branch_mut(branch).needs_work = false;
    Ok(())
}

/// Performs `work` on every marked device reachable from `branch`, with
/// the fewest coupler switches. On entry `branch` is reachable.
///
/// # Errors
///
/// Only errors that abort the pass.
pub fn do_all<W>(bus: &mut Bus, branch: BranchId, work: &mut W) -> Result<(), W1Error>
where
    W: BranchWork + ?Sized,
{
    debug!(target: "w1mult::doall", "do_all {branch:?}");
    activate_needed_branches(bus, branch)?;
    if let Err(error) = work.on_branch(bus, branch) {
        if error.aborts_pass() {
            return Err(error);
        }
        warn!(target: "w1mult::doall", "work on {branch:?} failed: {error}");
    }
    finish_work(bus, branch, work)
}

/// Runs `work` on each marked device of `branch`, then on the active
/// sub-branches that need work.
///
/// # Errors
///
/// Only errors that abort the pass; a failure of one device is logged and
/// the walk continues.
pub fn do_each<F>(bus: &mut Bus, branch: BranchId, work: &mut F) -> Result<(), W1Error>
where
    F: FnMut(&mut Bus, DeviceId) -> Result<(), W1Error>,
{
    debug!(target: "w1mult::doall", "do_each {branch:?}");
    let net = bus.net();
    let devices: Vec<DeviceId> = net
        .branch(branch)
        .child_devices
        .iter()
        .copied()
        .filter(|&id| {
            let device = net.device(id);
            device.sampling && device.found
        })
        .collect();
    for id in devices {
        if let Err(error) = work(bus, id) {
            if error.aborts_pass() {
                return Err(error);
            }
            warn!(
                target: "w1mult::doall",
                "device {} failed: {error}",
                bus.net().device(id).rom
            );
        }
    }
    for coupler in found_couplers(bus, branch) {
        if let Some(active) = bus.net().active_branch(coupler) {
            if wants_work(bus, active) {
                do_each(bus, active, work)?;
            }
        }
    }
    Ok(())
}
