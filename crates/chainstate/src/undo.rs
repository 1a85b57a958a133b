//! Outputs consumed by a connected block, kept so the block can be disconnected.

use zcore_consensus::Hash256;
use zcore_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use zcore_primitives::outpoint::OutPoint;
use zcore_storage::{Column, WriteBatch};

use crate::utxo::UtxoEntry;

const BLOCK_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// Spent outputs in the order the block consumed them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_var_bytes(&spent.entry.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let count = decoder.read_len()?;
        let mut spent = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let entry = UtxoEntry::decode(&decoder.read_var_bytes()?)
                .map_err(|_| DecodeError::InvalidData("invalid utxo entry in undo"))?;
            spent.push(SpentOutput { outpoint, entry });
        }
        decoder.finish()?;
        Ok(Self { spent })
    }

    pub fn stage(&self, block_hash: &Hash256, batch: &mut WriteBatch) {
        batch.put(Column::BlockUndo, block_hash, self.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_round_trips_and_rejects_unknown_version() {
        let undo = BlockUndo {
            spent: vec![
                SpentOutput {
                    outpoint: OutPoint::new([1u8; 32], 0),
                    entry: UtxoEntry {
                        value: 100,
                        script_pubkey: vec![0x51],
                        height: 3,
                        is_coinbase: true,
                    },
                },
                SpentOutput {
                    outpoint: OutPoint::new([2u8; 32], 5),
                    entry: UtxoEntry {
                        value: 7,
                        script_pubkey: Vec::new(),
                        height: 9,
                        is_coinbase: false,
                    },
                },
            ],
        };
        let bytes = undo.encode();
        assert_eq!(BlockUndo::decode(&bytes).expect("decode"), undo);

        let mut bad = bytes;
        bad[0] = 2;
        assert!(BlockUndo::decode(&bad).is_err());
    }
}
