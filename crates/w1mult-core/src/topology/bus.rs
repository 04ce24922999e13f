use std::fmt;
use std::time::Duration;

use log::{debug, error, warn};

use crate::clock::Clock;
use crate::program::{BusConfig, Completion, Executor, PostAction, Program, Transport};
use crate::status::{StatusCode, W1Error};

use super::{ActiveBranch, BranchId, DeviceId, Network};

/// Confirmation byte of the coupler direct-on-main command.
pub const DIRECT_ON_MAIN: u8 = 0xA5;

/// Everything a bus operation needs: the executor, the network it drives,
/// and the time source.
///
/// Also carries the reset cache. After a smart-on leaves exactly one branch
/// freshly reset, the next program on that branch may skip its own reset.
/// Any transaction invalidates the cache.
pub struct Bus {
    executor: Executor,
    net: Network,
    clock: Box<dyn Clock>,
    reset_point: Option<BranchId>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("executor", &self.executor)
            .field("devices", &self.net.len())
            .field("reset_point", &self.reset_point)
            .finish_non_exhaustive()
    }
}

/// Turns a non-OK data status into its error.
pub(crate) fn failure(status: StatusCode) -> W1Error {
    status.into_result().err().unwrap_or(W1Error::BusError)
}

impl Bus {
    /// Bus over `net` with no transport attached.
    #[must_use]
    pub fn new(net: Network, clock: Box<dyn Clock>) -> Self {
        Self {
            executor: Executor::new(),
            net,
            clock,
            reset_point: None,
        }
    }

    /// The device and branch arenas.
    #[must_use]
    pub const fn net(&self) -> &Network {
        &self.net
    }

    /// Mutable device and branch arenas.
    pub fn net_mut(&mut self) -> &mut Network {
        &mut self.net
    }

    /// Installs a transport.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.executor.attach(transport);
        self.reset_point = None;
    }

    /// Drops the transport.
    pub fn detach(&mut self) {
        self.executor.detach();
        self.reset_point = None;
    }

    /// Returns `true` while a transport is attached.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.executor.is_attached()
    }

    /// Programs submitted so far.
    #[must_use]
    pub const fn transactions(&self) -> u64 {
        self.executor.transactions()
    }

    /// Current time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Blocks until `deadline`.
    pub fn sleep_until(&self, deadline: Duration) {
        self.clock.sleep_until(deadline);
    }

    /// Resets the bus master.
    ///
    /// # Errors
    ///
    /// Returns the transport status when it is not OK.
    pub fn reset_master(&mut self) -> Result<(), W1Error> {
        self.reset_point = None;
        self.executor.reset_master()
    }

    /// Applies speed and timing parameters.
    ///
    /// # Errors
    ///
    /// Returns the transport status when it is not OK.
    pub fn configure(&mut self, config: &BusConfig) -> Result<(), W1Error> {
        self.executor.configure(config)
    }

    /// Runs `program` and applies its post-processing items to the network.
    ///
    /// A direct-on-main whose confirmation byte is wrong turns the
    /// completion status into `BusError`.
    ///
    /// # Errors
    ///
    /// Only `TransportGone`, `ProgramError` and `SequenceError`; every other
    /// status is returned inside the [`Completion`].
    pub fn run(&mut self, program: &Program) -> Result<Completion, W1Error> {
        self.reset_point = None;
        let mut completion = self.executor.run(program)?;
        for (action, status) in program.settle(&completion) {
            if !apply_post_action(&mut self.net, action, status, &completion.data) {
                completion.status = StatusCode::BusError;
            }
        }
        Ok(completion)
    }

    /// Runs `program` and returns the response bytes if every step ran.
    ///
    /// # Errors
    ///
    /// Returns the completion status when it is not OK.
    pub fn run_ok(&mut self, program: &Program) -> Result<Vec<u8>, W1Error> {
        self.run(program)?.into_data()
    }

    /// Records that `branch` was just reset by a smart-on.
    pub fn mark_reset(&mut self, branch: BranchId) {
        self.reset_point = Some(branch);
    }

    /// The branch left freshly reset by the last program, if any.
    #[must_use]
    pub const fn reset_point(&self) -> Option<BranchId> {
        self.reset_point
    }

    /// Programs a reset followed by the smart-ons needed to reach `branch`.
    ///
    /// A coupler is switched only when its known active side differs from
    /// the path. With `must_smart_on` the last coupler always gets a smart-on,
    /// which limits the following ROM command to `branch`.
    pub fn address_path(&self, program: &mut Program, branch: BranchId, must_smart_on: bool) {
        program.reset_simple();
        let path = self.net.path_to(branch);
        let hops = path.len();
        for (hop, (coupler, side)) in path.into_iter().enumerate() {
            let last = hop + 1 == hops;
            if (must_smart_on && last) || self.net.active(coupler) != ActiveBranch::from(side) {
                if let Some(target) = self.net.coupler_branch(coupler, side) {
                    program
                        .set_path(self.net.device(coupler).rom, side)
                        .post(PostAction::SmartOn(target));
                }
            }
        }
    }

    /// Programs the path to a device followed by a Match ROM.
    pub fn address_device(&self, program: &mut Program, id: DeviceId) {
        let device = self.net.device(id);
        self.address_path(program, device.parent, false);
        program.match_rom(device.rom);
    }

    /// Programs a reset and Match ROM for a device whose path is already
    /// active.
    pub fn readdress(&self, program: &mut Program, id: DeviceId) {
        program.reset_simple().match_rom(self.net.device(id).rom);
    }

    /// Programs a reset unless `branch` is already freshly reset.
    pub fn ensure_branch_reset(&self, program: &mut Program, branch: BranchId) {
        if self.reset_point != Some(branch) {
            program.reset_simple();
        }
    }

    /// Programs a reset that limits the next ROM command to `branch`: a
    /// smart-on of its own coupler, or a plain reset for the root. Nothing is
    /// programmed when `branch` is already freshly reset.
    pub fn ensure_branch_smart_reset(&self, program: &mut Program, branch: BranchId) {
        if self.reset_point == Some(branch) {
            return;
        }
        debug!(target: "w1mult::doall", "smart reset of {branch:?}");
        program.reset_simple();
        if let Some((coupler, side)) = self.net.branch(branch).owner {
            program
                .set_path(self.net.device(coupler).rom, side)
                .post(PostAction::SmartOn(branch));
        }
    }
}

/// Applies one settled post-processing item. Returns `false` when the
/// item turns a completed step into a bus error.
fn apply_post_action(
    net: &mut Network,
    action: PostAction,
    status: StatusCode,
    data: &[u8],
) -> bool {
    match action {
        PostAction::SmartOn(branch) => {
            let Some((coupler, side)) = net.branch(branch).owner else {
                return true;
            };
            match status {
                StatusCode::Ok | StatusCode::NoDevicePresent => {
                    net.set_active(coupler, side.into());
                }
                StatusCode::BusShorted => {
                    if net.active(coupler) == ActiveBranch::from(side) {
                        net.set_active(coupler, ActiveBranch::Unknown);
                    }
                    net.branch_mut(branch).shorted = true;
                    error!(
                        target: "w1mult::bus",
                        "coupler {} {side:?} branch is shorted",
                        net.device(coupler).rom
                    );
                }
                other => {
                    debug!(
                        target: "w1mult::bus",
                        "smart-on of coupler {} {side:?} got {other:?}",
                        net.device(coupler).rom
                    );
                }
            }
            true
        }
        PostAction::DirectOnMain { coupler, reply } => {
            if status != StatusCode::Ok {
                warn!(
                    target: "w1mult::bus",
                    "direct-on-main of coupler {} got {status:?}",
                    net.device(coupler).rom
                );
                return true;
            }
            if data.get(reply) == Some(&DIRECT_ON_MAIN) {
                net.set_active(coupler, ActiveBranch::Main);
                true
            } else {
                warn!(
                    target: "w1mult::bus",
                    "direct-on-main of coupler {} got confirmation {:02x?}",
                    net.device(coupler).rom,
                    data.get(reply)
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::apply_post_action;
    use crate::devices::{Coupler, Family};
    use crate::program::PostAction;
    use crate::rom::{Rom, FAMILY_COUPLER};
    use crate::status::StatusCode;
    use crate::topology::{ActiveBranch, BranchId, DeviceId, Network, Side};

    fn network() -> (Network, DeviceId, BranchId) {
        let mut net = Network::new();
        let coupler = net.push_device(
            Rom::with_crc(FAMILY_COUPLER, 9),
            BranchId::ROOT,
            Family::Coupler(Coupler::new(BranchId::ROOT, BranchId::ROOT)),
        );
        let aux = net.coupler_branch(coupler, Side::Aux).expect("aux");
        (net, coupler, aux)
    }

    #[test]
    fn smart_on_records_active_side_even_on_empty_branch() {
        let (mut net, coupler, aux) = network();
        assert!(apply_post_action(
            &mut net,
            PostAction::SmartOn(aux),
            StatusCode::NoDevicePresent,
            &[]
        ));
        assert_eq!(net.active(coupler), ActiveBranch::Aux);
    }

    #[test]
    fn shorted_smart_on_latches_and_forgets_side() {
        let (mut net, coupler, aux) = network();
        net.set_active(coupler, ActiveBranch::Aux);
        apply_post_action(&mut net, PostAction::SmartOn(aux), StatusCode::BusShorted, &[]);
        assert_eq!(net.active(coupler), ActiveBranch::Unknown);
        assert!(net.branch(aux).shorted);
    }

    #[test]
    fn direct_on_main_needs_its_confirmation_byte() {
        let (mut net, coupler, _) = network();
        let action = PostAction::DirectOnMain { coupler, reply: 0 };
        assert!(!apply_post_action(&mut net, action, StatusCode::Ok, &[0x00]));
        assert_eq!(net.active(coupler), ActiveBranch::Unknown);
        assert!(apply_post_action(&mut net, action, StatusCode::Ok, &[0xA5]));
        assert_eq!(net.active(coupler), ActiveBranch::Main);
    }
}
