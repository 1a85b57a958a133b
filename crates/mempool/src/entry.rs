//! Admission descriptors for pool transactions.

use std::collections::BTreeSet;

use zcore_chainstate::utxo::CoinsView;
use zcore_consensus::money::money_range;
use zcore_consensus::Hash256;
use zcore_primitives::outpoint::OutPoint;
use zcore_primitives::transaction::Transaction;

use crate::pool::Mempool;
use crate::MempoolError;

const MAX_PRIORITY: f64 = 1e16;

/// Per-input bytes not charged against priority: outpoint, sequence and a typical scriptSig.
const INPUT_OVERHEAD: usize = 41;
const MAX_SCRIPT_SIG_DISCOUNT: usize = 110;

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub size: usize,
    pub fee: i64,
    /// Transparent plus shielded value consumed.
    pub value_in: i64,
    pub time: u64,
    /// Tip height when the transaction entered the pool.
    pub height: i32,
    pub priority: f64,
    pub modified_size: usize,
    pub spends_coinbase: bool,
    /// No input referenced a transaction that was itself only in the pool.
    pub no_unconfirmed_parents: bool,
    pub branch_id: u32,
    pub spent_outpoints: Vec<OutPoint>,
    /// In-pool transactions this one spends from, sorted.
    pub parents: Vec<Hash256>,
}

impl MempoolEntry {
    /// Priority at `height`, adding the coin-age accrued since entry.
    pub fn priority_at(&self, height: i32) -> f64 {
        if self.modified_size == 0 {
            return self.priority;
        }
        let blocks = height.saturating_sub(self.height).max(0) as f64;
        let accrued = blocks * self.value_in.max(0) as f64 / self.modified_size as f64;
        (self.priority + accrued).min(MAX_PRIORITY)
    }

    /// Compares fee rates without division. `Less` means `self` pays less per byte.
    pub fn cmp_fee_rate(&self, other: &Self) -> std::cmp::Ordering {
        let left = i128::from(self.fee) * other.size.max(1) as i128;
        let right = i128::from(other.fee) * self.size.max(1) as i128;
        left.cmp(&right)
    }
}

/// Builds the descriptor for `tx` entering the pool at tip `height`.
///
/// `view` must resolve every input, including outputs of other pool transactions. Nothing is
/// cached: priority depends on `height` and is recomputed on every call.
pub fn make_entry<V: CoinsView + ?Sized>(
    tx: Transaction,
    view: &V,
    pool: &Mempool,
    height: i32,
    time: u64,
    branch_id: u32,
) -> Result<MempoolEntry, MempoolError> {
    let txid = tx.txid();
    let mut missing = Vec::new();
    let mut coins = Vec::with_capacity(tx.vin.len());
    for input in &tx.vin {
        match view.coin(&input.prevout)? {
            Some(coin) => coins.push(coin),
            None => missing.push(input.prevout.clone()),
        }
    }
    if !missing.is_empty() {
        missing.sort();
        return Err(MempoolError::MissingInputs(missing));
    }

    let transparent_in = coins
        .iter()
        .try_fold(0i64, |total, coin| {
            total.checked_add(coin.value).filter(|sum| money_range(*sum))
        })
        .ok_or(MempoolError::ValueOutOfRange(txid))?;
    let value_in = tx
        .shielded_value_in()
        .and_then(|shielded| shielded.checked_add(transparent_in))
        .ok_or(MempoolError::ValueOutOfRange(txid))?;
    let value_out = tx.value_out().ok_or(MempoolError::ValueOutOfRange(txid))?;
    if value_in < value_out {
        return Err(MempoolError::InputsBelowOutputs(txid));
    }

    let size = tx.serialized_size();
    let modified_size = modified_size(&tx, size);
    let priority = if tx.has_shielded_components() {
        MAX_PRIORITY
    } else if modified_size == 0 {
        0.0
    } else {
        let coin_age: f64 = coins
            .iter()
            .filter(|coin| i64::from(coin.height) <= i64::from(height))
            .map(|coin| {
                let age = i64::from(height) - i64::from(coin.height);
                coin.value.max(0) as f64 * age as f64
            })
            .sum();
        (coin_age / modified_size as f64).min(MAX_PRIORITY)
    };

    let parents: BTreeSet<Hash256> = tx
        .vin
        .iter()
        .map(|input| input.prevout.hash)
        .filter(|hash| pool.contains(hash))
        .collect();

    Ok(MempoolEntry {
        txid,
        size,
        fee: value_in - value_out,
        value_in,
        time,
        height,
        priority,
        modified_size,
        spends_coinbase: coins.iter().any(|coin| coin.is_coinbase),
        no_unconfirmed_parents: pool.has_no_inputs_of(&tx),
        branch_id,
        spent_outpoints: tx.vin.iter().map(|input| input.prevout.clone()).collect(),
        parents: parents.into_iter().collect(),
        tx,
    })
}

/// Serialized size less the per-input allowance, so spending many inputs is not penalised.
pub fn modified_size(tx: &Transaction, size: usize) -> usize {
    tx.vin.iter().fold(size, |size, input| {
        let offset = INPUT_OVERHEAD + input.script_sig.len().min(MAX_SCRIPT_SIG_DISCOUNT);
        if size > offset {
            size - offset
        } else {
            size
        }
    })
}
