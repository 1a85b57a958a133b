//! Template script verifier for P2PKH and P2PK outputs.

use std::sync::OnceLock;

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use zcore_primitives::hash::hash160;
use zcore_primitives::transaction::Transaction;

use crate::sighash::{signature_hash, SighashError, SighashType, SigningInput};
use crate::standard::{classify_script_pubkey, p2pk_key, p2pkh_key_hash, parse_pushes, ScriptType};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;

pub const BLOCK_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_NONE;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags =
    BLOCK_SCRIPT_VERIFY_FLAGS | SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_LOW_S;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptError {
    SigPushOnly,
    InvalidStackOperation,
    UnsupportedScript(ScriptType),
    PubkeyHashMismatch,
    SigEncoding,
    PubkeyEncoding,
    SigHashType,
    HighS,
    SigCheck,
    Sighash(SighashError),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::SigPushOnly => write!(f, "scriptSig is not push-only"),
            ScriptError::InvalidStackOperation => write!(f, "unexpected number of scriptSig items"),
            ScriptError::UnsupportedScript(kind) => {
                write!(f, "unsupported scriptPubKey template {kind:?}")
            }
            ScriptError::PubkeyHashMismatch => write!(f, "public key does not match key hash"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::PubkeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::SigHashType => write!(f, "invalid sighash type"),
            ScriptError::HighS => write!(f, "signature s value is not low"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::Sighash(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<SighashError> for ScriptError {
    fn from(err: SighashError) -> Self {
        ScriptError::Sighash(err)
    }
}

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

/// Checks `script_sig` against the P2PKH or P2PK `script_pubkey` of the output spent by input
/// `input_index` of `tx`. Other templates are rejected.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    amount: i64,
    flags: ScriptFlags,
    consensus_branch_id: u32,
) -> Result<(), ScriptError> {
    let items = parse_pushes(script_sig).ok_or(ScriptError::SigPushOnly)?;
    let checker = SignatureChecker {
        tx,
        input: SigningInput {
            index: input_index,
            script_code: script_pubkey,
            amount,
        },
        flags,
        consensus_branch_id,
    };

    match classify_script_pubkey(script_pubkey) {
        ScriptType::P2Pkh => {
            let [sig, pubkey] = items.as_slice() else {
                return Err(ScriptError::InvalidStackOperation);
            };
            let key_hash = p2pkh_key_hash(script_pubkey).ok_or(ScriptError::SigCheck)?;
            if hash160(pubkey).as_slice() != key_hash {
                return Err(ScriptError::PubkeyHashMismatch);
            }
            checker.check_sig(sig, pubkey)
        }
        ScriptType::P2Pk => {
            let [sig] = items.as_slice() else {
                return Err(ScriptError::InvalidStackOperation);
            };
            let pubkey = p2pk_key(script_pubkey).ok_or(ScriptError::SigCheck)?;
            checker.check_sig(sig, pubkey)
        }
        other => Err(ScriptError::UnsupportedScript(other)),
    }
}

struct SignatureChecker<'a> {
    tx: &'a Transaction,
    input: SigningInput<'a>,
    flags: ScriptFlags,
    consensus_branch_id: u32,
}

impl SignatureChecker<'_> {
    fn check_sig(&self, sig_bytes: &[u8], pubkey_bytes: &[u8]) -> Result<(), ScriptError> {
        let Some((&hash_type, der)) = sig_bytes.split_last() else {
            return Err(ScriptError::SigCheck);
        };
        let hash_type = SighashType(hash_type as u32);
        let strict = self.flags & SCRIPT_VERIFY_STRICTENC != 0;
        if strict && !hash_type.is_defined() {
            return Err(ScriptError::SigHashType);
        }
        if strict && !is_valid_pubkey_encoding(pubkey_bytes) {
            return Err(ScriptError::PubkeyEncoding);
        }

        let mut sig = Signature::from_der(der).map_err(|_| ScriptError::SigEncoding)?;
        let original = sig;
        sig.normalize_s();
        if self.flags & SCRIPT_VERIFY_LOW_S != 0 && sig != original {
            return Err(ScriptError::HighS);
        }
        let pubkey = PublicKey::from_slice(pubkey_bytes).map_err(|_| ScriptError::PubkeyEncoding)?;

        let sighash = signature_hash(
            self.tx,
            Some(self.input),
            hash_type,
            self.consensus_branch_id,
        )?;
        let message = Message::from_digest(sighash);
        SECP256K1_VERIFY
            .get_or_init(Secp256k1::verification_only)
            .verify_ecdsa(&message, &sig, &pubkey)
            .map_err(|_| ScriptError::SigCheck)
    }
}

fn is_valid_pubkey_encoding(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x02 | 0x03) => pubkey.len() == 33,
        Some(0x04) => pubkey.len() == 65,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_encodings() {
        assert!(is_valid_pubkey_encoding(&[0x02; 33]));
        assert!(is_valid_pubkey_encoding(&[0x04; 65]));
        assert!(!is_valid_pubkey_encoding(&[0x04; 33]));
        assert!(!is_valid_pubkey_encoding(&[0x05; 33]));
        assert!(!is_valid_pubkey_encoding(&[]));
    }
}
