//! Block header and block types.

use zcore_consensus::Hash256;

use crate::encoding::{read_vec, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const CURRENT_VERSION: i32 = 4;

#[derive(Clone, Debug, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub final_sapling_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: Hash256,
    pub solution: Vec<u8>,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block == [0u8; 32]
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_hash_le(&self.final_sapling_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_hash_le(&self.nonce);
        encoder.write_var_bytes(&self.solution);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            final_sapling_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_hash_le()?,
            solution: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn serialize(&self) -> Vec<u8> {
        crate::encoding::encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        crate::encoding::decode(bytes).map_err(BlockDecodeError::from)
    }

    /// Decodes one block from a stream of concatenated blocks.
    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, BlockDecodeError> {
        Block::consensus_decode(decoder).map_err(BlockDecodeError::from)
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        write_vec(encoder, &self.transactions);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            header: BlockHeader::consensus_decode(decoder)?,
            transactions: read_vec(decoder)?,
        })
    }
}

#[derive(Debug)]
pub enum BlockDecodeError {
    Decode(DecodeError),
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "block decode failed: {error}"),
        }
    }
}

impl std::error::Error for BlockDecodeError {}

/// Computes the transaction merkle root. The flag reports a duplicated adjacent pair,
/// which lets two different transaction lists share a root.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        for pair in layer.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1];
            layer.push(last);
        }
        layer = layer
            .chunks_exact(2)
            .map(|pair| {
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(&pair[0]);
                data[32..].copy_from_slice(&pair[1]);
                sha256d(&data)
            })
            .collect();
    }
    (layer[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> Hash256 {
        [byte; 32]
    }

    #[test]
    fn single_txid_is_its_own_root() {
        assert_eq!(merkle_root(&[hash(9)]), (hash(9), false));
    }

    #[test]
    fn duplicated_pair_marks_mutation() {
        let (_, mutated) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]);
        assert!(mutated);
        let (_, mutated) = merkle_root(&[hash(1), hash(1), hash(2), hash(3)]);
        assert!(mutated);
    }

    #[test]
    fn odd_padding_is_not_mutation() {
        let (root, mutated) = merkle_root(&[hash(1), hash(2), hash(3)]);
        assert!(!mutated);
        let (padded, _) = merkle_root(&[hash(1), hash(2), hash(3), hash(3)]);
        assert_eq!(root, padded);
    }
}
