//! Network upgrade schedule and consensus branch IDs.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UpgradeIndex {
    BaseSprout = 0,
    TestDummy = 1,
    Overwinter = 2,
    Sapling = 3,
    Blossom = 4,
    Heartwood = 5,
    Canopy = 6,
}

pub const MAX_NETWORK_UPGRADES: usize = 7;

pub const ALL_UPGRADES: [UpgradeIndex; MAX_NETWORK_UPGRADES] = [
    UpgradeIndex::BaseSprout,
    UpgradeIndex::TestDummy,
    UpgradeIndex::Overwinter,
    UpgradeIndex::Sapling,
    UpgradeIndex::Blossom,
    UpgradeIndex::Heartwood,
    UpgradeIndex::Canopy,
];

impl UpgradeIndex {
    pub const fn as_usize(self) -> usize {
        self as usize
    }
}

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, Debug)]
pub struct NetworkUpgrade {
    pub protocol_version: i32,
    pub activation_height: i32,
}

impl NetworkUpgrade {
    pub const ALWAYS_ACTIVE: i32 = 0;
    pub const NO_ACTIVATION_HEIGHT: i32 = -1;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeState {
    Disabled,
    Pending,
    Active,
}

#[derive(Clone, Copy, Debug)]
pub struct UpgradeInfo {
    pub branch_id: u32,
    pub name: &'static str,
    pub info: &'static str,
}

pub const NETWORK_UPGRADE_INFO: [UpgradeInfo; MAX_NETWORK_UPGRADES] = [
    UpgradeInfo {
        branch_id: 0,
        name: "Sprout",
        info: "The Zcash network at launch",
    },
    UpgradeInfo {
        branch_id: 0x7473_6554,
        name: "Test dummy",
        info: "Test dummy info",
    },
    UpgradeInfo {
        branch_id: 0x5ba8_1b19,
        name: "Overwinter",
        info: "See https://z.cash/upgrade/overwinter/ for details.",
    },
    UpgradeInfo {
        branch_id: 0x76b8_09bb,
        name: "Sapling",
        info: "See https://z.cash/upgrade/sapling/ for details.",
    },
    UpgradeInfo {
        branch_id: 0x2bb4_0e60,
        name: "Blossom",
        info: "See https://z.cash/upgrade/blossom/ for details.",
    },
    UpgradeInfo {
        branch_id: 0xf5b9_230b,
        name: "Heartwood",
        info: "See https://z.cash/upgrade/heartwood/ for details.",
    },
    UpgradeInfo {
        branch_id: 0xe9ff_75a6,
        name: "Canopy",
        info: "See https://z.cash/upgrade/canopy/ for details.",
    },
];

pub const SPROUT_BRANCH_ID: u32 = NETWORK_UPGRADE_INFO[UpgradeIndex::BaseSprout as usize].branch_id;

pub fn network_upgrade_state(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> UpgradeState {
    let activation_height = upgrades[idx.as_usize()].activation_height;
    if activation_height == NetworkUpgrade::NO_ACTIVATION_HEIGHT {
        UpgradeState::Disabled
    } else if height >= activation_height {
        UpgradeState::Active
    } else {
        UpgradeState::Pending
    }
}

pub fn network_upgrade_active(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> bool {
    network_upgrade_state(height, upgrades, idx) == UpgradeState::Active
}

pub fn current_epoch(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
) -> UpgradeIndex {
    for idx in ALL_UPGRADES.iter().rev() {
        if network_upgrade_active(height, upgrades, *idx) {
            return *idx;
        }
    }
    UpgradeIndex::BaseSprout
}

pub fn current_epoch_branch_id(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
) -> u32 {
    let idx = current_epoch(height, upgrades);
    NETWORK_UPGRADE_INFO[idx.as_usize()].branch_id
}

pub fn is_consensus_branch_id(branch_id: u32) -> bool {
    NETWORK_UPGRADE_INFO
        .iter()
        .any(|info| info.branch_id == branch_id)
}

pub fn next_epoch(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
) -> Option<UpgradeIndex> {
    if height < 0 {
        return None;
    }
    for idx in ALL_UPGRADES.iter().skip(1) {
        if network_upgrade_state(height, upgrades, *idx) == UpgradeState::Pending {
            return Some(*idx);
        }
    }
    None
}

pub fn next_activation_height(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
) -> Option<i32> {
    next_epoch(height, upgrades).map(|idx| upgrades[idx.as_usize()].activation_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{consensus_params, Network};

    #[test]
    fn mainnet_activation_edges() {
        let params = consensus_params(Network::Mainnet);

        assert!(!network_upgrade_active(
            347_499,
            &params.upgrades,
            UpgradeIndex::Overwinter
        ));
        assert!(network_upgrade_active(
            347_500,
            &params.upgrades,
            UpgradeIndex::Overwinter
        ));
        assert!(!network_upgrade_active(
            1_046_399,
            &params.upgrades,
            UpgradeIndex::Canopy
        ));
        assert!(network_upgrade_active(
            1_046_400,
            &params.upgrades,
            UpgradeIndex::Canopy
        ));
    }

    #[test]
    fn branch_id_selection() {
        let params = consensus_params(Network::Mainnet);

        assert_eq!(
            current_epoch_branch_id(0, &params.upgrades),
            SPROUT_BRANCH_ID
        );
        assert_eq!(current_epoch_branch_id(419_200, &params.upgrades), 0x76b8_09bb);
        assert_eq!(current_epoch_branch_id(419_199, &params.upgrades), 0x5ba8_1b19);
        assert!(is_consensus_branch_id(0xe9ff_75a6));
        assert!(!is_consensus_branch_id(0xdead_beef));
    }

    #[test]
    fn regtest_upgrades_disabled_until_set() {
        let mut params = consensus_params(Network::Regtest);
        assert_eq!(
            network_upgrade_state(10, &params.upgrades, UpgradeIndex::Sapling),
            UpgradeState::Disabled
        );
        params.set_activation_height(UpgradeIndex::Sapling, 5);
        assert!(network_upgrade_active(5, &params.upgrades, UpgradeIndex::Sapling));
        assert_eq!(next_activation_height(0, &params.upgrades), Some(5));
    }

    #[test]
    fn next_activation_height_tracking() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(next_activation_height(0, &params.upgrades), Some(347_500));
        assert_eq!(
            next_activation_height(347_500, &params.upgrades),
            Some(419_200)
        );
        assert_eq!(next_activation_height(1_046_400, &params.upgrades), None);
    }
}
