//! Block index records as stored in the `BlockIndex` column.

use primitive_types::U256;
use zcore_consensus::Hash256;
use zcore_pow::difficulty::{chainwork_from_bytes, chainwork_to_bytes};
use zcore_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::flatfiles::FileLocation;

const ENTRY_VERSION: u8 = 1;

/// Validation progress of a block. Ordered: a status only moves forward, except that any
/// status may move to `Failed`, which is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BlockStatus {
    HeaderOnly,
    DataAvailable,
    ScriptValid,
    Failed,
}

impl BlockStatus {
    fn to_u8(self) -> u8 {
        match self {
            BlockStatus::HeaderOnly => 0,
            BlockStatus::DataAvailable => 1,
            BlockStatus::ScriptValid => 2,
            BlockStatus::Failed => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlockStatus::HeaderOnly),
            1 => Some(BlockStatus::DataAvailable),
            2 => Some(BlockStatus::ScriptValid),
            3 => Some(BlockStatus::Failed),
            _ => None,
        }
    }

    pub fn is_failed(self) -> bool {
        self == BlockStatus::Failed
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_advance_to(self, next: BlockStatus) -> bool {
        !self.is_failed() && (next.is_failed() || next > self)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev: Hash256,
    pub height: i32,
    pub chainwork: U256,
    pub status: BlockStatus,
    pub location: Option<FileLocation>,
    pub bits: u32,
    pub time: u32,
    /// First-seen order; breaks chain-work ties.
    pub sequence: u64,
}

impl BlockIndexEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(128);
        encoder.write_u8(ENTRY_VERSION);
        encoder.write_hash_le(&self.prev);
        encoder.write_i32_le(self.height);
        encoder.write_bytes(&chainwork_to_bytes(self.chainwork));
        encoder.write_u8(self.status.to_u8());
        match &self.location {
            Some(location) => {
                encoder.write_u8(1);
                encoder.write_bytes(&location.encode());
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.time);
        encoder.write_u64_le(self.sequence);
        encoder.into_inner()
    }

    /// Decodes a record stored under `hash`.
    pub fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != ENTRY_VERSION {
            return Err(DecodeError::InvalidData("unsupported block index version"));
        }
        let prev = decoder.read_hash_le()?;
        let height = decoder.read_i32_le()?;
        let chainwork = chainwork_from_bytes(&decoder.read_fixed::<32>()?);
        let status = BlockStatus::from_u8(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("invalid block status"))?;
        let location = match decoder.read_u8()? {
            0 => None,
            1 => Some(FileLocation::decode(
                &decoder.read_fixed::<{ FileLocation::ENCODED_LEN }>()?,
            )),
            _ => return Err(DecodeError::InvalidData("invalid location flag")),
        };
        let bits = decoder.read_u32_le()?;
        let time = decoder.read_u32_le()?;
        let sequence = decoder.read_u64_le()?;
        decoder.finish()?;
        Ok(Self {
            hash,
            prev,
            height,
            chainwork,
            status,
            location,
            bits,
            time,
            sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order() {
        use BlockStatus::*;
        assert!(HeaderOnly.can_advance_to(DataAvailable));
        assert!(HeaderOnly.can_advance_to(ScriptValid));
        assert!(ScriptValid.can_advance_to(Failed));
        assert!(!ScriptValid.can_advance_to(DataAvailable));
        assert!(!DataAvailable.can_advance_to(DataAvailable));
        assert!(!Failed.can_advance_to(ScriptValid));
        assert!(!Failed.can_advance_to(Failed));
    }

    #[test]
    fn entry_round_trips() {
        let entry = BlockIndexEntry {
            hash: [3u8; 32],
            prev: [2u8; 32],
            height: 12,
            chainwork: U256::from(0x1234_5678u64) << 100,
            status: BlockStatus::DataAvailable,
            location: Some(FileLocation {
                file_id: 1,
                offset: 99,
                len: 500,
            }),
            bits: 0x200f_0f0f,
            time: 1_700_000_000,
            sequence: 7,
        };
        let decoded = BlockIndexEntry::decode(entry.hash, &entry.encode()).expect("decode");
        assert_eq!(decoded, entry);

        let header_only = BlockIndexEntry {
            location: None,
            status: BlockStatus::HeaderOnly,
            ..entry
        };
        let decoded =
            BlockIndexEntry::decode(header_only.hash, &header_only.encode()).expect("decode");
        assert_eq!(decoded.location, None);
    }
}
