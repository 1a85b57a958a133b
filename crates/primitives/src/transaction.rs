//! Transaction types and serialization for the Sprout, Overwinter and Sapling formats.

use zcore_consensus::Hash256;

use crate::encoding::{
    read_vec, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const OVERWINTER_VERSION_GROUP_ID: u32 = 0x03C4_8270;
pub const SAPLING_VERSION_GROUP_ID: u32 = 0x892F_2085;

pub const ZC_NUM_JS_INPUTS: usize = 2;
pub const ZC_NUM_JS_OUTPUTS: usize = 2;
pub const ZC_NOTE_CIPHERTEXT_SIZE: usize = 601;
pub const SAPLING_ENC_CIPHERTEXT_SIZE: usize = 580;
pub const SAPLING_OUT_CIPHERTEXT_SIZE: usize = 80;
pub const GROTH_PROOF_SIZE: usize = 192;
pub const PHGR_PROOF_SIZE: usize = 296;

const OVERWINTERED_FLAG: u32 = 1 << 31;

pub type GrothProof = [u8; GROTH_PROOF_SIZE];
pub type PhgrProof = [u8; PHGR_PROOF_SIZE];
pub type JoinSplitCiphertext = [u8; ZC_NOTE_CIPHERTEXT_SIZE];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxFormat {
    /// Versions 1 and 2; version 2 carries PHGR JoinSplits.
    Sprout,
    /// Version 3 with the Overwinter version group.
    Overwinter,
    /// Version 4 with the Sapling version group.
    Sapling,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            prevout: OutPoint::consensus_decode(decoder)?,
            script_sig: decoder.read_var_bytes()?,
            sequence: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            value: decoder.read_i64_le()?,
            script_pubkey: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpendDescription {
    pub cv: Hash256,
    pub anchor: Hash256,
    pub nullifier: Hash256,
    pub rk: Hash256,
    pub zkproof: GrothProof,
    pub spend_auth_sig: [u8; 64],
}

impl Encodable for SpendDescription {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        for field in [&self.cv, &self.anchor, &self.nullifier, &self.rk] {
            encoder.write_hash_le(field);
        }
        encoder.write_bytes(&self.zkproof);
        encoder.write_bytes(&self.spend_auth_sig);
    }
}

impl Decodable for SpendDescription {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            cv: decoder.read_hash_le()?,
            anchor: decoder.read_hash_le()?,
            nullifier: decoder.read_hash_le()?,
            rk: decoder.read_hash_le()?,
            zkproof: decoder.read_fixed()?,
            spend_auth_sig: decoder.read_fixed()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutputDescription {
    pub cv: Hash256,
    pub cmu: Hash256,
    pub ephemeral_key: Hash256,
    pub enc_ciphertext: [u8; SAPLING_ENC_CIPHERTEXT_SIZE],
    pub out_ciphertext: [u8; SAPLING_OUT_CIPHERTEXT_SIZE],
    pub zkproof: GrothProof,
}

impl Encodable for OutputDescription {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        for field in [&self.cv, &self.cmu, &self.ephemeral_key] {
            encoder.write_hash_le(field);
        }
        encoder.write_bytes(&self.enc_ciphertext);
        encoder.write_bytes(&self.out_ciphertext);
        encoder.write_bytes(&self.zkproof);
    }
}

impl Decodable for OutputDescription {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            cv: decoder.read_hash_le()?,
            cmu: decoder.read_hash_le()?,
            ephemeral_key: decoder.read_hash_le()?,
            enc_ciphertext: decoder.read_fixed()?,
            out_ciphertext: decoder.read_fixed()?,
            zkproof: decoder.read_fixed()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SproutProof {
    Groth(GrothProof),
    Phgr(PhgrProof),
}

impl SproutProof {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SproutProof::Groth(proof) => proof,
            SproutProof::Phgr(proof) => proof,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JoinSplit {
    pub vpub_old: i64,
    pub vpub_new: i64,
    pub anchor: Hash256,
    pub nullifiers: [Hash256; ZC_NUM_JS_INPUTS],
    pub commitments: [Hash256; ZC_NUM_JS_OUTPUTS],
    pub ephemeral_key: Hash256,
    pub random_seed: Hash256,
    pub macs: [Hash256; ZC_NUM_JS_INPUTS],
    pub proof: SproutProof,
    pub ciphertexts: [JoinSplitCiphertext; ZC_NUM_JS_OUTPUTS],
}

impl JoinSplit {
    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.vpub_old);
        encoder.write_i64_le(self.vpub_new);
        encoder.write_hash_le(&self.anchor);
        for hash in self.nullifiers.iter().chain(&self.commitments) {
            encoder.write_hash_le(hash);
        }
        encoder.write_hash_le(&self.ephemeral_key);
        encoder.write_hash_le(&self.random_seed);
        for mac in &self.macs {
            encoder.write_hash_le(mac);
        }
        encoder.write_bytes(self.proof.as_bytes());
        for ciphertext in &self.ciphertexts {
            encoder.write_bytes(ciphertext);
        }
    }

    fn consensus_decode(decoder: &mut Decoder, use_groth: bool) -> Result<Self, DecodeError> {
        let vpub_old = decoder.read_i64_le()?;
        let vpub_new = decoder.read_i64_le()?;
        let anchor = decoder.read_hash_le()?;
        let nullifiers = [decoder.read_hash_le()?, decoder.read_hash_le()?];
        let commitments = [decoder.read_hash_le()?, decoder.read_hash_le()?];
        let ephemeral_key = decoder.read_hash_le()?;
        let random_seed = decoder.read_hash_le()?;
        let macs = [decoder.read_hash_le()?, decoder.read_hash_le()?];
        let proof = if use_groth {
            SproutProof::Groth(decoder.read_fixed()?)
        } else {
            SproutProof::Phgr(decoder.read_fixed()?)
        };
        let ciphertexts = [decoder.read_fixed()?, decoder.read_fixed()?];
        Ok(Self {
            vpub_old,
            vpub_new,
            anchor,
            nullifiers,
            commitments,
            ephemeral_key,
            random_seed,
            macs,
            proof,
            ciphertexts,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub overwintered: bool,
    pub version: i32,
    pub version_group_id: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
    pub expiry_height: u32,
    pub value_balance: i64,
    pub shielded_spends: Vec<SpendDescription>,
    pub shielded_outputs: Vec<OutputDescription>,
    pub join_splits: Vec<JoinSplit>,
    pub join_split_pub_key: [u8; 32],
    pub join_split_sig: [u8; 64],
    pub binding_sig: [u8; 64],
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            overwintered: false,
            version: 1,
            version_group_id: 0,
            vin: Vec::new(),
            vout: Vec::new(),
            lock_time: 0,
            expiry_height: 0,
            value_balance: 0,
            shielded_spends: Vec::new(),
            shielded_outputs: Vec::new(),
            join_splits: Vec::new(),
            join_split_pub_key: [0u8; 32],
            join_split_sig: [0u8; 64],
            binding_sig: [0u8; 64],
        }
    }
}

impl Transaction {
    /// A version 4 Sapling-format transaction with no inputs or outputs.
    pub fn sapling() -> Self {
        Self {
            overwintered: true,
            version: 4,
            version_group_id: SAPLING_VERSION_GROUP_ID,
            ..Self::default()
        }
    }

    pub fn format(&self) -> Result<TxFormat, DecodeError> {
        tx_format(self.overwintered, self.version, self.version_group_id)
    }

    pub fn header(&self) -> u32 {
        let mut header = self.version as u32;
        if self.overwintered {
            header |= OVERWINTERED_FLAG;
        }
        header
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn has_shielded_components(&self) -> bool {
        !self.join_splits.is_empty()
            || !self.shielded_spends.is_empty()
            || !self.shielded_outputs.is_empty()
    }

    /// Sum of transparent output values, or `None` on overflow.
    pub fn value_out(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |total, output| total.checked_add(output.value))
    }

    /// Value moved from the shielded pools into the transparent pool.
    pub fn shielded_value_in(&self) -> Option<i64> {
        let from_sprout = self
            .join_splits
            .iter()
            .try_fold(0i64, |total, js| total.checked_add(js.vpub_new))?;
        let into_sprout = self
            .join_splits
            .iter()
            .try_fold(0i64, |total, js| total.checked_add(js.vpub_old))?;
        from_sprout
            .checked_sub(into_sprout)?
            .checked_add(self.value_balance)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(256);
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        self.serialize().len()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.serialize())
    }
}

fn tx_format(overwintered: bool, version: i32, group_id: u32) -> Result<TxFormat, DecodeError> {
    match (overwintered, version, group_id) {
        (false, 1 | 2, _) => Ok(TxFormat::Sprout),
        (true, 3, OVERWINTER_VERSION_GROUP_ID) => Ok(TxFormat::Overwinter),
        (true, 4, SAPLING_VERSION_GROUP_ID) => Ok(TxFormat::Sapling),
        (false, _, _) => Err(DecodeError::InvalidData("unsupported transaction version")),
        (true, _, _) => Err(DecodeError::InvalidData(
            "unknown overwinter transaction format",
        )),
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.header());
        if self.overwintered {
            encoder.write_u32_le(self.version_group_id);
        }
        write_vec(encoder, &self.vin);
        write_vec(encoder, &self.vout);
        encoder.write_u32_le(self.lock_time);
        let format = self.format().unwrap_or(TxFormat::Sprout);
        if format != TxFormat::Sprout {
            encoder.write_u32_le(self.expiry_height);
        }
        if format == TxFormat::Sapling {
            encoder.write_i64_le(self.value_balance);
            write_vec(encoder, &self.shielded_spends);
            write_vec(encoder, &self.shielded_outputs);
        }
        if self.version >= 2 {
            encoder.write_varint(self.join_splits.len() as u64);
            for join_split in &self.join_splits {
                join_split.consensus_encode(encoder);
            }
            if !self.join_splits.is_empty() {
                encoder.write_bytes(&self.join_split_pub_key);
                encoder.write_bytes(&self.join_split_sig);
            }
        }
        if format == TxFormat::Sapling
            && !(self.shielded_spends.is_empty() && self.shielded_outputs.is_empty())
        {
            encoder.write_bytes(&self.binding_sig);
        }
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = decoder.read_u32_le()?;
        let overwintered = header & OVERWINTERED_FLAG != 0;
        let version = (header & !OVERWINTERED_FLAG) as i32;
        let version_group_id = if overwintered {
            decoder.read_u32_le()?
        } else {
            0
        };
        let format = tx_format(overwintered, version, version_group_id)?;

        let mut tx = Transaction {
            overwintered,
            version,
            version_group_id,
            vin: read_vec(decoder)?,
            vout: read_vec(decoder)?,
            lock_time: decoder.read_u32_le()?,
            ..Transaction::default()
        };
        if format != TxFormat::Sprout {
            tx.expiry_height = decoder.read_u32_le()?;
        }
        if format == TxFormat::Sapling {
            tx.value_balance = decoder.read_i64_le()?;
            tx.shielded_spends = read_vec(decoder)?;
            tx.shielded_outputs = read_vec(decoder)?;
        }
        if version >= 2 {
            let count = decoder.read_len()?;
            let use_groth = format == TxFormat::Sapling;
            for _ in 0..count {
                tx.join_splits
                    .push(JoinSplit::consensus_decode(decoder, use_groth)?);
            }
            if count > 0 {
                tx.join_split_pub_key = decoder.read_fixed()?;
                tx.join_split_sig = decoder.read_fixed()?;
            }
        }
        if format == TxFormat::Sapling
            && !(tx.shielded_spends.is_empty() && tx.shielded_outputs.is_empty())
        {
            tx.binding_sig = decoder.read_fixed()?;
        }
        Ok(tx)
    }
}
