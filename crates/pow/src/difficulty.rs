//! Compact target encoding and per-block work.

use primitive_types::U256;
use zcore_consensus::ConsensusParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
    Zero,
    AboveLimit,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
            CompactError::Zero => write!(f, "compact target is zero"),
            CompactError::AboveLimit => write!(f, "compact target is easier than the pow limit"),
        }
    }
}

impl std::error::Error for CompactError {}

/// Expands nBits into the full 256-bit target.
pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 && mantissa != 0 {
        return Err(CompactError::Negative);
    }
    if mantissa != 0
        && (size > 34 || (mantissa > 0xff && size > 33) || (mantissa > 0xffff && size > 32))
    {
        return Err(CompactError::Overflow);
    }
    Ok(if size <= 3 {
        U256::from(mantissa >> (8 * (3 - size)))
    } else {
        U256::from(mantissa) << (8 * (size - 3) as usize)
    })
}

pub fn u256_to_compact(value: U256) -> u32 {
    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3) as usize)).low_u32()
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

/// Checks that nBits decodes to a usable target no easier than the network limit.
pub fn check_target_bits(bits: u32, params: &ConsensusParams) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(CompactError::Zero);
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return Err(CompactError::AboveLimit);
    }
    Ok(target)
}

/// Expected number of hashes to find a block at `bits`: 2^256 / (target + 1).
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    // 2^256 does not fit; (~target / (target + 1)) + 1 is the same quotient.
    Ok((!target / (target + U256::one())) + U256::one())
}

pub fn chainwork_to_bytes(work: U256) -> [u8; 32] {
    work.to_big_endian()
}

pub fn chainwork_from_bytes(bytes: &[u8; 32]) -> U256 {
    U256::from_big_endian(bytes)
}
