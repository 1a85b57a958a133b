//! Signature hashes for transparent inputs.
//!
//! Pre-Overwinter transactions use the legacy double-SHA256 digest over a modified copy of the
//! transaction. Overwinter (v3) and Sapling (v4) transactions use the BLAKE2b digests of ZIP 143
//! and ZIP 243, personalized with the consensus branch id so that signatures do not replay
//! across network upgrades.

use blake2b_simd::Params as Blake2bParams;
use zcore_consensus::Hash256;
use zcore_primitives::encoding::{Encodable, Encoder};
use zcore_primitives::hash::sha256d;
use zcore_primitives::transaction::{Transaction, TxFormat, TxOut};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn anyone_can_pay(self) -> bool {
        self.0 & SIGHASH_ANYONECANPAY != 0
    }

    /// True for the three defined base types, with or without ANYONECANPAY.
    pub fn is_defined(self) -> bool {
        matches!(self.0 & !SIGHASH_ANYONECANPAY, SIGHASH_ALL | SIGHASH_NONE | SIGHASH_SINGLE)
    }
}

/// The input being signed together with the script code and value of the output it spends.
#[derive(Clone, Copy, Debug)]
pub struct SigningInput<'a> {
    pub index: usize,
    pub script_code: &'a [u8],
    pub amount: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SighashError {
    InputIndexOutOfRange,
    MissingOutput,
    UnsupportedFormat,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::MissingOutput => write!(f, "no matching output for SIGHASH_SINGLE"),
            SighashError::UnsupportedFormat => write!(f, "unsupported transaction format"),
        }
    }
}

impl std::error::Error for SighashError {}

const PREVOUTS_PERSONALIZATION: &[u8; 16] = b"ZcashPrevoutHash";
const SEQUENCE_PERSONALIZATION: &[u8; 16] = b"ZcashSequencHash";
const OUTPUTS_PERSONALIZATION: &[u8; 16] = b"ZcashOutputsHash";
const JOINSPLITS_PERSONALIZATION: &[u8; 16] = b"ZcashJSplitsHash";
const SHIELDED_SPENDS_PERSONALIZATION: &[u8; 16] = b"ZcashSSpendsHash";
const SHIELDED_OUTPUTS_PERSONALIZATION: &[u8; 16] = b"ZcashSOutputHash";

/// Digest signed by the input described by `input`, or the shielded-only digest when `input`
/// is `None` (v3/v4 only).
pub fn signature_hash(
    tx: &Transaction,
    input: Option<SigningInput<'_>>,
    hash_type: SighashType,
    consensus_branch_id: u32,
) -> Result<Hash256, SighashError> {
    if let Some(input) = input {
        if input.index >= tx.vin.len() {
            return Err(SighashError::InputIndexOutOfRange);
        }
    }
    match tx.format().map_err(|_| SighashError::UnsupportedFormat)? {
        TxFormat::Sprout => {
            let input = input.ok_or(SighashError::InputIndexOutOfRange)?;
            legacy_hash(tx, input, hash_type)
        }
        TxFormat::Overwinter => Ok(zip143_hash(tx, input, hash_type, consensus_branch_id, false)),
        TxFormat::Sapling => Ok(zip143_hash(tx, input, hash_type, consensus_branch_id, true)),
    }
}

fn legacy_hash(
    tx: &Transaction,
    input: SigningInput<'_>,
    hash_type: SighashType,
) -> Result<Hash256, SighashError> {
    let base = hash_type.base_type();
    let single = base == SIGHASH_SINGLE;
    let none = base == SIGHASH_NONE;
    if single && input.index >= tx.vout.len() {
        return Err(SighashError::MissingOutput);
    }

    let mut encoder = Encoder::with_capacity(tx.vin.len() * 41 + tx.vout.len() * 34 + 64);
    encoder.write_i32_le(tx.version);

    let signed_inputs: Vec<usize> = if hash_type.anyone_can_pay() {
        vec![input.index]
    } else {
        (0..tx.vin.len()).collect()
    };
    encoder.write_varint(signed_inputs.len() as u64);
    for index in signed_inputs {
        let txin = &tx.vin[index];
        txin.prevout.consensus_encode(&mut encoder);
        if index == input.index {
            encoder.write_var_bytes(input.script_code);
            encoder.write_u32_le(txin.sequence);
        } else {
            encoder.write_varint(0);
            encoder.write_u32_le(if single || none { 0 } else { txin.sequence });
        }
    }

    let output_count = match (none, single) {
        (true, _) => 0,
        (false, true) => input.index + 1,
        (false, false) => tx.vout.len(),
    };
    encoder.write_varint(output_count as u64);
    for (index, output) in tx.vout.iter().take(output_count).enumerate() {
        if single && index != input.index {
            encoder.write_i64_le(-1);
            encoder.write_varint(0);
        } else {
            output.consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    if tx.version >= 2 {
        encoder.write_varint(tx.join_splits.len() as u64);
        for join_split in &tx.join_splits {
            join_split.consensus_encode(&mut encoder);
        }
        if !tx.join_splits.is_empty() {
            encoder.write_bytes(&tx.join_split_pub_key);
            // The joinsplit signature is blanked while signing.
            encoder.write_bytes(&[0u8; 64]);
        }
    }
    encoder.write_u32_le(hash_type.0);

    Ok(sha256d(&encoder.into_inner()))
}

fn zip143_hash(
    tx: &Transaction,
    input: Option<SigningInput<'_>>,
    hash_type: SighashType,
    consensus_branch_id: u32,
    sapling: bool,
) -> Hash256 {
    let base = hash_type.base_type();
    let all_outputs = base != SIGHASH_SINGLE && base != SIGHASH_NONE;

    let prevouts = if hash_type.anyone_can_pay() {
        [0u8; 32]
    } else {
        digest(PREVOUTS_PERSONALIZATION, |encoder| {
            tx.vin
                .iter()
                .for_each(|txin| txin.prevout.consensus_encode(encoder))
        })
    };
    let sequences = if !hash_type.anyone_can_pay() && all_outputs {
        digest(SEQUENCE_PERSONALIZATION, |encoder| {
            tx.vin
                .iter()
                .for_each(|txin| encoder.write_u32_le(txin.sequence))
        })
    } else {
        [0u8; 32]
    };
    let outputs = if all_outputs {
        outputs_digest(&tx.vout)
    } else {
        match input {
            Some(input) if base == SIGHASH_SINGLE && input.index < tx.vout.len() => {
                outputs_digest(std::slice::from_ref(&tx.vout[input.index]))
            }
            _ => [0u8; 32],
        }
    };
    let join_splits = if tx.join_splits.is_empty() {
        [0u8; 32]
    } else {
        digest(JOINSPLITS_PERSONALIZATION, |encoder| {
            for join_split in &tx.join_splits {
                join_split.consensus_encode(encoder);
            }
            encoder.write_bytes(&tx.join_split_pub_key);
        })
    };

    let mut encoder = Encoder::with_capacity(256);
    encoder.write_u32_le(tx.header());
    encoder.write_u32_le(tx.version_group_id);
    encoder.write_bytes(&prevouts);
    encoder.write_bytes(&sequences);
    encoder.write_bytes(&outputs);
    encoder.write_bytes(&join_splits);
    if sapling {
        let spends = if tx.shielded_spends.is_empty() {
            [0u8; 32]
        } else {
            digest(SHIELDED_SPENDS_PERSONALIZATION, |encoder| {
                // Spend authorization signatures are excluded.
                for spend in &tx.shielded_spends {
                    encoder.write_hash_le(&spend.cv);
                    encoder.write_hash_le(&spend.anchor);
                    encoder.write_hash_le(&spend.nullifier);
                    encoder.write_hash_le(&spend.rk);
                    encoder.write_bytes(&spend.zkproof);
                }
            })
        };
        let shielded_outputs = if tx.shielded_outputs.is_empty() {
            [0u8; 32]
        } else {
            digest(SHIELDED_OUTPUTS_PERSONALIZATION, |encoder| {
                tx.shielded_outputs
                    .iter()
                    .for_each(|output| output.consensus_encode(encoder))
            })
        };
        encoder.write_bytes(&spends);
        encoder.write_bytes(&shielded_outputs);
    }
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(tx.expiry_height);
    if sapling {
        encoder.write_i64_le(tx.value_balance);
    }
    encoder.write_u32_le(hash_type.0);
    if let Some(input) = input {
        let txin = &tx.vin[input.index];
        txin.prevout.consensus_encode(&mut encoder);
        encoder.write_var_bytes(input.script_code);
        encoder.write_i64_le(input.amount);
        encoder.write_u32_le(txin.sequence);
    }

    let mut personalization = [0u8; 16];
    personalization[..12].copy_from_slice(b"ZcashSigHash");
    personalization[12..].copy_from_slice(&consensus_branch_id.to_le_bytes());
    blake2b_256(&personalization, &encoder.into_inner())
}

fn outputs_digest(outputs: &[TxOut]) -> Hash256 {
    digest(OUTPUTS_PERSONALIZATION, |encoder| {
        outputs
            .iter()
            .for_each(|output| output.consensus_encode(encoder))
    })
}

fn digest(personalization: &[u8; 16], fill: impl FnOnce(&mut Encoder)) -> Hash256 {
    let mut encoder = Encoder::new();
    fill(&mut encoder);
    blake2b_256(personalization, &encoder.into_inner())
}

fn blake2b_256(personalization: &[u8; 16], data: &[u8]) -> Hash256 {
    let hash = Blake2bParams::new()
        .hash_length(32)
        .personal(personalization)
        .hash(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}
