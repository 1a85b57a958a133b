//! Consensus constants, parameters, and upgrade schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod upgrades;

pub use params::{
    consensus_params, hash256_from_hex, hash256_to_hex, ConsensusParams, HexError, Network,
};
pub use upgrades::Hash256;
