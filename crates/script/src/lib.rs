//! Transparent script checks: signature hashes, standard templates and the template verifier.

pub mod sighash;
pub mod standard;
pub mod verify;

pub use sighash::{signature_hash, SighashError, SighashType, SigningInput};
pub use standard::{classify_script_pubkey, legacy_sigop_count, ScriptType};
pub use verify::{verify_script, ScriptError, ScriptFlags};
