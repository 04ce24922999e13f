//! Branch tree, device arena and coupler routing.
//!
//! Devices and branches live in flat arenas indexed by [`DeviceId`] and
//! [`BranchId`]. A coupler owns exactly two branches; each branch records
//! its owning coupler and side instead of a back pointer.

/// Bus handle: executor, network and path addressing.
pub mod bus;
pub use bus::{Bus, DIRECT_ON_MAIN};

/// Device discovery and full-bus rescan.
pub mod search;
pub use search::{next_seed, scan_bus, search_path, ScanReport, ALL_LINES_OFF, MAX_SCAN_ATTEMPTS};

/// Switch-minimising work passes.
pub mod work;
pub use work::{activate_needed_branches, do_all, do_each, finish_work, BranchWork, EachDevice};

use crate::devices::{Coupler, Family};
use crate::rom::Rom;

/// Index of a device in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DeviceId(pub usize);

/// Index of a branch in the arena. The root is always index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(usize);

impl BranchId {
    /// The bus root segment.
    pub const ROOT: Self = Self(0);

    /// Returns `true` for the root segment.
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

/// One of the two branches of a coupler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Side {
    /// Main branch.
    Main,
    /// Auxiliary branch.
    Aux,
}

impl Side {
    /// The opposite side.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Main => Self::Aux,
            Self::Aux => Self::Main,
        }
    }
}

/// Which branch of a coupler is electrically connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActiveBranch {
    /// Not known since the last rescan or all-lines-off.
    #[default]
    Unknown,
    /// Main branch is on.
    Main,
    /// Aux branch is on.
    Aux,
}

impl ActiveBranch {
    /// The active side, when known.
    #[must_use]
    pub const fn side(self) -> Option<Side> {
        match self {
            Self::Unknown => None,
            Self::Main => Some(Side::Main),
            Self::Aux => Some(Side::Aux),
        }
    }
}

impl From<Side> for ActiveBranch {
    fn from(side: Side) -> Self {
        match side {
            Side::Main => Self::Main,
            Side::Aux => Self::Aux,
        }
    }
}

/// A bus segment: the root, or one side of a coupler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Branch {
    /// Owning coupler and side; `None` for the root.
    pub owner: Option<(DeviceId, Side)>,
    /// Couplers attached directly to this segment.
    pub child_couplers: Vec<DeviceId>,
    /// Other devices attached directly to this segment.
    pub child_devices: Vec<DeviceId>,
    /// Set while this segment or a descendant has sampling work pending.
    pub needs_work: bool,
    /// Latched when a short is detected; cleared by a rescan.
    pub shorted: bool,
}

/// A configured device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// ROM id.
    pub rom: Rom,
    /// Segment the device is attached to.
    pub parent: BranchId,
    /// Present on the last scan.
    pub found: bool,
    /// Selected for the current work pass. Implies `found`.
    pub sampling: bool,
    /// Family tag and family-specific state.
    pub family: Family,
}

/// The device and branch arenas.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    devices: Vec<Device>,
    branches: Vec<Branch>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    /// Network holding only the root segment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            branches: vec![Branch::default()],
        }
    }

    /// Appends a device under `parent`. Couplers get their two branches.
    pub(crate) fn push_device(&mut self, rom: Rom, parent: BranchId, family: Family) -> DeviceId {
        let id = DeviceId(self.devices.len());
        let family = match family {
            Family::Coupler(_) => {
                let main = self.push_branch(id, Side::Main);
                let aux = self.push_branch(id, Side::Aux);
                Family::Coupler(Coupler::new(main, aux))
            }
            other => other,
        };
        let is_coupler = matches!(family, Family::Coupler(_));
        self.devices.push(Device {
            rom,
            parent,
            found: false,
            sampling: false,
            family,
        });
        let branch = &mut self.branches[parent.0];
        if is_coupler {
            branch.child_couplers.push(id);
        } else {
            branch.child_devices.push(id);
        }
        id
    }

    fn push_branch(&mut self, owner: DeviceId, side: Side) -> BranchId {
        let id = BranchId(self.branches.len());
        self.branches.push(Branch {
            owner: Some((owner, side)),
            ..Branch::default()
        });
        id
    }

    /// Number of configured devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns `true` when no device is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device ids in configuration order.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> {
        (0..self.devices.len()).map(DeviceId)
    }

    /// Device by id.
    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0)
    }

    /// Device by id.
    ///
    /// # Panics
    ///
    /// Panics when `id` was not issued by this network.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> &Device {
        &self.devices[id.0]
    }

    /// Mutable device by id.
    ///
    /// # Panics
    ///
    /// Panics when `id` was not issued by this network.
    pub fn device_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.devices[id.0]
    }

    /// Branch by id.
    ///
    /// # Panics
    ///
    /// Panics when `id` was not issued by this network.
    #[must_use]
    pub fn branch(&self, id: BranchId) -> &Branch {
        &self.branches[id.0]
    }

    /// Mutable branch by id.
    ///
    /// # Panics
    ///
    /// Panics when `id` was not issued by this network.
    pub fn branch_mut(&mut self, id: BranchId) -> &mut Branch {
        &mut self.branches[id.0]
    }

    /// Coupler state of a device, if it is a coupler.
    #[must_use]
    pub fn coupler(&self, id: DeviceId) -> Option<&Coupler> {
        match &self.device(id).family {
            Family::Coupler(coupler) => Some(coupler),
            _ => None,
        }
    }

    fn coupler_mut(&mut self, id: DeviceId) -> Option<&mut Coupler> {
        match &mut self.device_mut(id).family {
            Family::Coupler(coupler) => Some(coupler),
            _ => None,
        }
    }

    /// The branch of `coupler` on `side`.
    #[must_use]
    pub fn coupler_branch(&self, coupler: DeviceId, side: Side) -> Option<BranchId> {
        self.coupler(coupler).map(|c| c.branch(side))
    }

    /// Which side of `coupler` is believed to be connected.
    #[must_use]
    pub fn active(&self, coupler: DeviceId) -> ActiveBranch {
        self.coupler(coupler).map_or(ActiveBranch::Unknown, |c| c.active)
    }

    /// Records the connected side of `coupler`.
    pub fn set_active(&mut self, coupler: DeviceId, active: ActiveBranch) {
        if let Some(state) = self.coupler_mut(coupler) {
            state.active = active;
        }
    }

    /// The connected branch of `coupler`, when known.
    #[must_use]
    pub fn active_branch(&self, coupler: DeviceId) -> Option<BranchId> {
        self.coupler(coupler)
            .and_then(|c| c.active.side().map(|side| c.branch(side)))
    }

    /// Couplers and sides from the root down to `branch`, outermost first.
    #[must_use]
    pub fn path_to(&self, branch: BranchId) -> Vec<(DeviceId, Side)> {
        let mut path = Vec::new();
        let mut current = branch;
        while let Some((coupler, side)) = self.branch(current).owner {
            path.push((coupler, side));
            current = self.device(coupler).parent;
        }
        path.reverse();
        path
    }

    /// Returns `true` when `branch` or any segment above it is shorted.
    #[must_use]
    pub fn path_shorted(&self, branch: BranchId) -> bool {
        let mut current = branch;
        loop {
            let segment = self.branch(current);
            if segment.shorted {
                return true;
            }
            match segment.owner {
                Some((coupler, _)) => current = self.device(coupler).parent,
                None => return false,
            }
        }
    }

    /// Finds the configured device with `rom` attached to `branch`.
    #[must_use]
    pub fn find_on_branch(&self, rom: Rom, branch: BranchId) -> Option<DeviceId> {
        let segment = self.branch(branch);
        segment
            .child_devices
            .iter()
            .chain(&segment.child_couplers)
            .copied()
            .find(|&id| self.device(id).rom == rom)
    }

    /// Finds a configured device by ROM anywhere in the tree.
    #[must_use]
    pub fn find(&self, rom: Rom) -> Option<DeviceId> {
        self.ids().find(|&id| self.device(id).rom == rom)
    }

    /// Marks the found devices among `candidates` for this pass and flags
    /// every segment above them as needing work. Devices behind a shorted
    /// segment are skipped. Returns the marked ids.
    pub fn mark_for_sampling(&mut self, candidates: &[DeviceId]) -> Vec<DeviceId> {
        let mut marked = Vec::new();
        for &id in candidates {
            let device = self.device(id);
            if !device.found || self.path_shorted(device.parent) {
                continue;
            }
            let mut branch = device.parent;
            self.device_mut(id).sampling = true;
            marked.push(id);
            loop {
                let segment = self.branch_mut(branch);
                segment.needs_work = true;
                match segment.owner {
                    Some((coupler, _)) => branch = self.device(coupler).parent,
                    None => break,
                }
            }
        }
        marked
    }

    /// Ends a work pass: clears `sampling` on `marked` and every
    /// `needs_work` flag.
    pub fn finish_pass(&mut self, marked: &[DeviceId]) {
        for &id in marked {
            self.device_mut(id).sampling = false;
        }
        for branch in &mut self.branches {
            branch.needs_work = false;
        }
    }

    /// Clears `needs_work` on `branch` and everything below it.
    pub fn clear_work_below(&mut self, branch: BranchId) {
        let mut pending = vec![branch];
        while let Some(current) = pending.pop() {
            let segment = self.branch_mut(current);
            segment.needs_work = false;
            let couplers = segment.child_couplers.clone();
            for coupler in couplers {
                if let Some(state) = self.coupler(coupler) {
                    pending.push(state.main);
                    pending.push(state.aux);
                }
            }
        }
    }

    /// Forgets everything learned from the bus before a rescan: presence,
    /// sampling marks, coupler states and short latches.
    pub fn reset_for_scan(&mut self) {
        for branch in &mut self.branches {
            branch.needs_work = false;
            branch.shorted = false;
        }
        for device in &mut self.devices {
            device.found = false;
            device.sampling = false;
            if let Family::Coupler(coupler) = &mut device.family {
                coupler.active = ActiveBranch::Unknown;
            }
        }
    }

    /// Marks every device offline after the transport disappeared.
    pub fn mark_all_lost(&mut self) {
        for device in &mut self.devices {
            device.found = false;
            device.sampling = false;
        }
        for branch in &mut self.branches {
            branch.needs_work = false;
        }
    }

    /// Configured devices not present on the last scan.
    #[must_use]
    pub fn missing(&self) -> Vec<DeviceId> {
        self.ids().filter(|&id| !self.device(id).found).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ActiveBranch, BranchId, Network, Side};
    use crate::devices::{Coupler, Family, Thermometer};
    use crate::rom::{Rom, FAMILY_COUPLER, FAMILY_THERMOMETER};

    fn coupler_family() -> Family {
        Family::Coupler(Coupler::new(BranchId::ROOT, BranchId::ROOT))
    }

    fn thermometer_family() -> Family {
        Family::Thermometer(Thermometer::default())
    }

    fn two_level() -> (Network, super::DeviceId, super::DeviceId, super::DeviceId) {
        let mut net = Network::new();
        let coupler = net.push_device(
            Rom::with_crc(FAMILY_COUPLER, 1),
            BranchId::ROOT,
            coupler_family(),
        );
        let aux = net
            .coupler_branch(coupler, Side::Aux)
            .expect("coupler has branches");
        let on_root = net.push_device(
            Rom::with_crc(FAMILY_THERMOMETER, 2),
            BranchId::ROOT,
            thermometer_family(),
        );
        let on_aux = net.push_device(
            Rom::with_crc(FAMILY_THERMOMETER, 3),
            aux,
            thermometer_family(),
        );
        (net, coupler, on_root, on_aux)
    }

    #[test]
    fn couplers_own_two_fresh_branches() {
        let (net, coupler, _, on_aux) = two_level();
        let main = net.coupler_branch(coupler, Side::Main).expect("main");
        let aux = net.coupler_branch(coupler, Side::Aux).expect("aux");
        assert_ne!(main, aux);
        assert_eq!(net.branch(aux).owner, Some((coupler, Side::Aux)));
        assert_eq!(net.branch(aux).child_devices, vec![on_aux]);
        assert_eq!(net.branch(BranchId::ROOT).child_couplers, vec![coupler]);
    }

    #[test]
    fn path_lists_couplers_outermost_first() {
        let (net, coupler, on_root, on_aux) = two_level();
        assert!(net.path_to(net.device(on_root).parent).is_empty());
        assert_eq!(
            net.path_to(net.device(on_aux).parent),
            vec![(coupler, Side::Aux)]
        );
    }

    #[test]
    fn marking_skips_missing_devices_and_flags_ancestors() {
        let (mut net, coupler, on_root, on_aux) = two_level();
        net.device_mut(on_aux).found = true;
        let marked = net.mark_for_sampling(&[on_root, on_aux]);
        assert_eq!(marked, vec![on_aux]);
        let aux = net.coupler_branch(coupler, Side::Aux).expect("aux");
        assert!(net.branch(aux).needs_work);
        assert!(net.branch(BranchId::ROOT).needs_work);
        assert!(!net.device(on_root).sampling);

        net.finish_pass(&marked);
        assert!(!net.device(on_aux).sampling);
        assert!(!net.branch(aux).needs_work);
    }

    #[test]
    fn shorted_segments_are_not_marked() {
        let (mut net, coupler, _, on_aux) = two_level();
        net.device_mut(on_aux).found = true;
        let aux = net.coupler_branch(coupler, Side::Aux).expect("aux");
        net.branch_mut(aux).shorted = true;
        assert!(net.mark_for_sampling(&[on_aux]).is_empty());
    }

    #[test]
    fn rescan_reset_forgets_bus_state() {
        let (mut net, coupler, on_root, _) = two_level();
        net.device_mut(on_root).found = true;
        net.set_active(coupler, ActiveBranch::Main);
        net.branch_mut(BranchId::ROOT).shorted = true;
        net.reset_for_scan();
        assert!(!net.device(on_root).found);
        assert_eq!(net.active(coupler), ActiveBranch::Unknown);
        assert!(!net.branch(BranchId::ROOT).shorted);
        assert_eq!(net.missing().len(), 3);
    }
}
