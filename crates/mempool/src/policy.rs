//! Relay policy: rules a transaction must meet to enter the pool beyond consensus validity.

use zcore_chainstate::utxo::UtxoEntry;
use zcore_consensus::constants::{
    ALLOW_FREE_THRESHOLD, MAX_BLOCK_SIZE, MAX_STANDARD_TX_SIGOPS, MAX_STANDARD_TX_SIZE,
};
use zcore_primitives::transaction::Transaction;
use zcore_script::standard::{parse_pushes, MAX_OP_RETURN_RELAY};
use zcore_script::{classify_script_pubkey, legacy_sigop_count, ScriptType};

use crate::entry::MempoolEntry;
use crate::MempoolError;

/// Zatoshis per 1000 bytes.
pub const DEFAULT_MIN_RELAY_FEE_PER_KB: i64 = 100;
const MAX_STANDARD_SCRIPT_SIG_SIZE: usize = 1650;
const FREE_TX_SIZE_LIMIT: usize = MAX_BLOCK_SIZE as usize / 2 - 1000;
/// Bytes needed to spend a typical output, charged when pricing dust.
const SPEND_INPUT_SIZE: usize = 148;

#[derive(Clone, Debug)]
pub struct MempoolPolicy {
    pub require_standard: bool,
    pub min_relay_fee_per_kb: i64,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self::standard(DEFAULT_MIN_RELAY_FEE_PER_KB)
    }
}

impl MempoolPolicy {
    pub fn standard(min_relay_fee_per_kb: i64) -> Self {
        Self {
            require_standard: true,
            min_relay_fee_per_kb: min_relay_fee_per_kb.max(0),
        }
    }

    /// Accepts anything consensus-valid with any fee.
    pub fn permissive() -> Self {
        Self {
            require_standard: false,
            min_relay_fee_per_kb: 0,
        }
    }

    pub fn min_relay_fee_for_size(&self, size: usize) -> i64 {
        if self.min_relay_fee_per_kb <= 0 {
            return 0;
        }
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let fee = self.min_relay_fee_per_kb.saturating_mul(size) / 1000;
        if fee == 0 {
            self.min_relay_fee_per_kb
        } else {
            fee
        }
    }

    /// Checks that need only the transaction itself.
    pub fn check_transaction(&self, tx: &Transaction) -> Result<(), MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase);
        }
        if !self.require_standard {
            return Ok(());
        }
        if tx.serialized_size() >= MAX_STANDARD_TX_SIZE as usize {
            return Err(MempoolError::NonStandard("tx-size"));
        }
        for input in &tx.vin {
            if input.script_sig.len() > MAX_STANDARD_SCRIPT_SIG_SIZE {
                return Err(MempoolError::NonStandard("scriptsig-size"));
            }
            if parse_pushes(&input.script_sig).is_none() {
                return Err(MempoolError::NonStandard("scriptsig-not-pushonly"));
            }
        }

        let mut null_data = 0usize;
        for output in &tx.vout {
            match classify_script_pubkey(&output.script_pubkey) {
                ScriptType::NullData => {
                    null_data += 1;
                    continue;
                }
                ScriptType::Unknown => return Err(MempoolError::NonStandard("scriptpubkey")),
                ScriptType::P2Pk | ScriptType::P2Pkh | ScriptType::P2Sh => {}
            }
            if self.is_dust(output.value, output.script_pubkey.len()) {
                return Err(MempoolError::NonStandard("dust"));
            }
        }
        if null_data > 1 {
            return Err(MempoolError::NonStandard("multi-op-return"));
        }
        Ok(())
    }

    /// Checks scriptSigs against the outputs they spend, in input order.
    pub fn check_inputs(&self, tx: &Transaction, spent: &[UtxoEntry]) -> Result<(), MempoolError> {
        if !self.require_standard {
            return Ok(());
        }
        let mut sigops = 0usize;
        for (input, coin) in tx.vin.iter().zip(spent) {
            let stack = parse_pushes(&input.script_sig)
                .ok_or(MempoolError::NonStandard("scriptsig-not-pushonly"))?;
            let expected = match classify_script_pubkey(&coin.script_pubkey) {
                ScriptType::P2Pkh => 2,
                ScriptType::P2Pk => 1,
                _ => return Err(MempoolError::NonStandard("nonstandard-input")),
            };
            if stack.len() != expected {
                return Err(MempoolError::NonStandard("scriptsig-args"));
            }
            sigops += legacy_sigop_count(&input.script_sig);
        }
        sigops += tx
            .vout
            .iter()
            .map(|output| legacy_sigop_count(&output.script_pubkey))
            .sum::<usize>();
        if sigops > MAX_STANDARD_TX_SIGOPS as usize {
            return Err(MempoolError::NonStandard("bad-txns-too-many-sigops"));
        }
        Ok(())
    }

    /// Small transactions with high priority may pay nothing; the rest pay the relay fee.
    pub fn check_fee(&self, entry: &MempoolEntry) -> Result<(), MempoolError> {
        let required = self.min_relay_fee_for_size(entry.size);
        let free = entry.size < FREE_TX_SIZE_LIMIT && entry.priority > ALLOW_FREE_THRESHOLD;
        if entry.fee < required && !free {
            return Err(MempoolError::InsufficientFee {
                fee: entry.fee,
                required,
            });
        }
        Ok(())
    }

    fn is_dust(&self, value: i64, script_len: usize) -> bool {
        if self.min_relay_fee_per_kb <= 0 {
            return false;
        }
        let output_size = 8 + compact_size_len(script_len) + script_len;
        value < self.min_relay_fee_for_size(output_size + SPEND_INPUT_SIZE) * 3
    }
}

fn compact_size_len(value: usize) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
