//! Shielded proving parameters and the proof-verifier interface.
//!
//! Proof systems are not implemented here. Consensus code hands each proof, together with the
//! public inputs it commits to, to a [`ProofVerifier`] selected at node startup.

mod params;
mod verify;

use std::fmt;

pub use params::{
    default_params_dir, load_params, LoadedParams, ParamsError, ParamsId, ParamsKind, ParamsSet,
};
pub use verify::{joinsplit_hsig, verify_shielded, ProofVerifier};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShieldedComponent {
    SaplingSpend,
    SaplingOutput,
    JoinSplit,
}

impl fmt::Display for ShieldedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShieldedComponent::SaplingSpend => "sapling spend",
            ShieldedComponent::SaplingOutput => "sapling output",
            ShieldedComponent::JoinSplit => "joinsplit",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShieldedError {
    InvalidProof {
        component: ShieldedComponent,
        index: usize,
    },
    ValueOutOfRange(ShieldedComponent, usize),
}

impl fmt::Display for ShieldedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShieldedError::InvalidProof { component, index } => {
                write!(f, "invalid {component} proof at index {index}")
            }
            ShieldedError::ValueOutOfRange(component, index) => {
                write!(f, "{component} {index} value out of range")
            }
        }
    }
}

impl std::error::Error for ShieldedError {}
