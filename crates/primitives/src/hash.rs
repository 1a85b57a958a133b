use ripemd::{Digest, Ripemd160};
use sha2::Sha256;
use zcore_consensus::Hash256;

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    sha256(&Sha256::digest(data))
}

/// RIPEMD160(SHA256(data)), the pay-to-pubkey-hash digest.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(Sha256::digest(data)));
    out
}
