//! Consensus checks shared by block connection and pool admission.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;
use zcore_consensus::constants::{
    MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_TX_SIZE_AFTER_SAPLING, MAX_TX_SIZE_BEFORE_SAPLING,
    MIN_BLOCK_VERSION,
};
use zcore_consensus::money::money_range;
use zcore_consensus::upgrades::{network_upgrade_active, UpgradeIndex};
use zcore_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use zcore_pow::difficulty::{check_target_bits, CompactError};
use zcore_primitives::block::{merkle_root, Block, BlockHeader};
use zcore_primitives::outpoint::OutPoint;
use zcore_primitives::transaction::{Transaction, TxFormat};
use zcore_script::legacy_sigop_count;
use zcore_script::verify::{ScriptFlags, BLOCK_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS};
use zcore_shielded::{verify_shielded, ParamsSet, ProofVerifier, ShieldedError};
use zcore_storage::StoreError;

use crate::checkqueue::{ScriptFailure, ScriptJob};
use crate::undo::SpentOutput;
use crate::utxo::{CoinsView, UtxoEntry, UtxoError, UtxoOverlay};

const LOCKTIME_THRESHOLD: u32 = 500_000_000;

#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    pub check_scripts: bool,
    pub script_flags: ScriptFlags,
}

impl ValidationFlags {
    pub fn block() -> Self {
        Self {
            check_scripts: true,
            script_flags: BLOCK_SCRIPT_VERIFY_FLAGS,
        }
    }

    pub fn standard() -> Self {
        Self {
            check_scripts: true,
            script_flags: STANDARD_SCRIPT_VERIFY_FLAGS,
        }
    }
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self::block()
    }
}

/// A rule violation. Deterministic: every node reaches the same verdict on the same state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConsensusViolation {
    EmptyBlock,
    BlockTooLarge(usize),
    BadBlockVersion(i32),
    BadBits(CompactError),
    MissingCoinbase,
    ExtraCoinbase(usize),
    DuplicateTransaction(Hash256),
    BadMerkleRoot,
    MutatedMerkleTree,
    TooManySigops(usize),
    InvalidTransaction { txid: Hash256, reason: &'static str },
    ValueOutOfRange(Hash256),
    DuplicateInput(OutPoint),
    NonFinal(Hash256),
    Expired(Hash256),
    MissingInput(OutPoint),
    DuplicateOutput(OutPoint),
    PrematureCoinbaseSpend { outpoint: OutPoint, depth: i64 },
    InputsBelowOutputs(Hash256),
    InvalidScript(ScriptFailure),
    InvalidShielded { txid: Hash256, error: ShieldedError },
    ShieldedUnverified(Hash256),
    FailedParent(Hash256),
    KnownInvalid(Hash256),
}

impl ConsensusViolation {
    /// The body does not match the header it was sent with, so only this copy is bad.
    pub fn is_corruption_possible(&self) -> bool {
        matches!(
            self,
            ConsensusViolation::BadMerkleRoot
                | ConsensusViolation::MutatedMerkleTree
                | ConsensusViolation::DuplicateTransaction(_)
                | ConsensusViolation::BlockTooLarge(_)
        )
    }
}

impl std::fmt::Display for ConsensusViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusViolation::EmptyBlock => write!(f, "block has no transactions"),
            ConsensusViolation::BlockTooLarge(size) => write!(f, "block size {size} too large"),
            ConsensusViolation::BadBlockVersion(version) => {
                write!(f, "block version {version} too low")
            }
            ConsensusViolation::BadBits(err) => write!(f, "bad nBits: {err}"),
            ConsensusViolation::MissingCoinbase => write!(f, "first transaction is not coinbase"),
            ConsensusViolation::ExtraCoinbase(index) => {
                write!(f, "transaction {index} is a second coinbase")
            }
            ConsensusViolation::DuplicateTransaction(txid) => {
                write!(f, "duplicate transaction {}", hash256_to_hex(txid))
            }
            ConsensusViolation::BadMerkleRoot => write!(f, "merkle root mismatch"),
            ConsensusViolation::MutatedMerkleTree => write!(f, "merkle tree has duplicate leaves"),
            ConsensusViolation::TooManySigops(count) => {
                write!(f, "block has {count} signature operations")
            }
            ConsensusViolation::InvalidTransaction { txid, reason } => {
                write!(f, "transaction {}: {reason}", hash256_to_hex(txid))
            }
            ConsensusViolation::ValueOutOfRange(txid) => {
                write!(f, "transaction {} value out of range", hash256_to_hex(txid))
            }
            ConsensusViolation::DuplicateInput(outpoint) => {
                write!(f, "input {outpoint} spent twice in one transaction")
            }
            ConsensusViolation::NonFinal(txid) => {
                write!(f, "transaction {} is not final", hash256_to_hex(txid))
            }
            ConsensusViolation::Expired(txid) => {
                write!(f, "transaction {} has expired", hash256_to_hex(txid))
            }
            ConsensusViolation::MissingInput(outpoint) => {
                write!(f, "input {outpoint} is missing or spent")
            }
            ConsensusViolation::DuplicateOutput(outpoint) => {
                write!(f, "output {outpoint} already exists")
            }
            ConsensusViolation::PrematureCoinbaseSpend { outpoint, depth } => {
                write!(f, "coinbase output {outpoint} spent at depth {depth}")
            }
            ConsensusViolation::InputsBelowOutputs(txid) => write!(
                f,
                "transaction {} spends more than its inputs",
                hash256_to_hex(txid)
            ),
            ConsensusViolation::InvalidScript(failure) => write!(f, "{failure}"),
            ConsensusViolation::InvalidShielded { txid, error } => {
                write!(f, "transaction {}: {error}", hash256_to_hex(txid))
            }
            ConsensusViolation::ShieldedUnverified(txid) => write!(
                f,
                "transaction {} has shielded components but no proof verifier is loaded",
                hash256_to_hex(txid)
            ),
            ConsensusViolation::FailedParent(hash) => {
                write!(f, "parent block {} is invalid", hash256_to_hex(hash))
            }
            ConsensusViolation::KnownInvalid(hash) => {
                write!(f, "block {} is already known invalid", hash256_to_hex(hash))
            }
        }
    }
}

impl std::error::Error for ConsensusViolation {}

/// Failure of a check that reads chain state.
#[derive(Debug)]
pub enum ValidationError {
    Consensus(ConsensusViolation),
    Store(StoreError),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Consensus(err) => write!(f, "{err}"),
            ValidationError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConsensusViolation> for ValidationError {
    fn from(err: ConsensusViolation) -> Self {
        ValidationError::Consensus(err)
    }
}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        ValidationError::Store(err)
    }
}

fn invalid(txid: &Hash256, reason: &'static str) -> ConsensusViolation {
    ConsensusViolation::InvalidTransaction {
        txid: *txid,
        reason,
    }
}

pub fn compute_txids(block: &Block) -> Vec<Hash256> {
    block.transactions.par_iter().map(Transaction::txid).collect()
}

pub fn check_block_header(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), ConsensusViolation> {
    if header.version < MIN_BLOCK_VERSION {
        return Err(ConsensusViolation::BadBlockVersion(header.version));
    }
    check_target_bits(header.bits, params).map_err(ConsensusViolation::BadBits)?;
    Ok(())
}

/// Structural checks that need no chain state. Run before any script job is submitted.
pub fn check_block_structure(block: &Block, txids: &[Hash256]) -> Result<(), ConsensusViolation> {
    // Header commitment first, so a tampered body never reaches the checks that fail the header.
    let (root, mutated) = merkle_root(txids);
    if mutated {
        return Err(ConsensusViolation::MutatedMerkleTree);
    }
    if root != block.header.merkle_root {
        return Err(ConsensusViolation::BadMerkleRoot);
    }
    let mut seen = HashSet::with_capacity(txids.len());
    if let Some(duplicate) = txids.iter().find(|txid| !seen.insert(**txid)) {
        return Err(ConsensusViolation::DuplicateTransaction(*duplicate));
    }
    let size = block.serialize().len();
    if size > MAX_BLOCK_SIZE as usize {
        return Err(ConsensusViolation::BlockTooLarge(size));
    }

    if block.transactions.is_empty() {
        return Err(ConsensusViolation::EmptyBlock);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusViolation::MissingCoinbase);
    }
    if let Some(index) = block.transactions.iter().skip(1).position(Transaction::is_coinbase) {
        return Err(ConsensusViolation::ExtraCoinbase(index + 1));
    }

    let sigops = block_sigops(block);
    if sigops > MAX_BLOCK_SIGOPS as usize {
        return Err(ConsensusViolation::TooManySigops(sigops));
    }

    for (tx, txid) in block.transactions.iter().zip(txids) {
        check_transaction(tx, txid)?;
    }
    Ok(())
}

pub fn block_sigops(block: &Block) -> usize {
    block.transactions.iter().map(transaction_sigops).sum()
}

pub fn transaction_sigops(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .vin
        .iter()
        .map(|input| legacy_sigop_count(&input.script_sig))
        .sum();
    let outputs: usize = tx
        .vout
        .iter()
        .map(|output| legacy_sigop_count(&output.script_pubkey))
        .sum();
    inputs + outputs
}

/// Checks that do not depend on chain state or height.
pub fn check_transaction(tx: &Transaction, txid: &Hash256) -> Result<(), ConsensusViolation> {
    let has_joinsplit = !tx.join_splits.is_empty();
    let has_spends = !tx.shielded_spends.is_empty();
    let has_outputs = !tx.shielded_outputs.is_empty();

    if tx.vin.is_empty() && !has_joinsplit && !has_spends {
        return Err(invalid(txid, "no inputs"));
    }
    if tx.vout.is_empty() && !has_joinsplit && !has_outputs {
        return Err(invalid(txid, "no outputs"));
    }
    if tx.serialized_size() > MAX_TX_SIZE_AFTER_SAPLING as usize {
        return Err(invalid(txid, "transaction too large"));
    }

    let mut value_out = 0i64;
    for output in &tx.vout {
        if !money_range(output.value) {
            return Err(ConsensusViolation::ValueOutOfRange(*txid));
        }
        value_out = value_out
            .checked_add(output.value)
            .filter(|total| money_range(*total))
            .ok_or(ConsensusViolation::ValueOutOfRange(*txid))?;
    }
    if !has_spends && !has_outputs && tx.value_balance != 0 {
        return Err(invalid(txid, "value balance without shielded components"));
    }
    if !money_range(tx.value_balance.saturating_abs()) {
        return Err(ConsensusViolation::ValueOutOfRange(*txid));
    }
    for join_split in &tx.join_splits {
        if !money_range(join_split.vpub_old) || !money_range(join_split.vpub_new) {
            return Err(ConsensusViolation::ValueOutOfRange(*txid));
        }
        if join_split.vpub_old != 0 && join_split.vpub_new != 0 {
            return Err(invalid(txid, "joinsplit moves value both ways"));
        }
    }
    if tx.shielded_value_in().is_none() {
        return Err(ConsensusViolation::ValueOutOfRange(*txid));
    }

    let mut seen_inputs = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen_inputs.insert(&input.prevout) {
            return Err(ConsensusViolation::DuplicateInput(input.prevout.clone()));
        }
    }

    let mut nullifiers = HashSet::new();
    let sprout = tx.join_splits.iter().flat_map(|js| js.nullifiers.iter());
    let sapling = tx.shielded_spends.iter().map(|spend| &spend.nullifier);
    if !sprout.chain(sapling).all(|nullifier| nullifiers.insert(*nullifier)) {
        return Err(invalid(txid, "duplicate nullifier"));
    }

    if tx.is_coinbase() {
        if has_joinsplit || has_spends || has_outputs {
            return Err(invalid(txid, "coinbase has shielded components"));
        }
        if !(2..=100).contains(&tx.vin[0].script_sig.len()) {
            return Err(invalid(txid, "coinbase scriptSig length out of range"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(invalid(txid, "null prevout outside coinbase"));
    }
    Ok(())
}

/// Checks that depend on the height the transaction would be mined at.
pub fn contextual_check_transaction(
    tx: &Transaction,
    txid: &Hash256,
    height: i32,
    block_time: u32,
    params: &ConsensusParams,
) -> Result<(), ConsensusViolation> {
    let overwinter = network_upgrade_active(height, &params.upgrades, UpgradeIndex::Overwinter);
    let sapling = network_upgrade_active(height, &params.upgrades, UpgradeIndex::Sapling);
    let format = tx
        .format()
        .map_err(|_| invalid(txid, "unknown transaction format"))?;
    match format {
        TxFormat::Sprout if overwinter => {
            return Err(invalid(txid, "transaction must be overwintered"));
        }
        TxFormat::Overwinter if !overwinter => {
            return Err(invalid(txid, "overwinter is not active"));
        }
        TxFormat::Overwinter if sapling => {
            return Err(invalid(txid, "overwinter format after sapling activation"));
        }
        TxFormat::Sapling if !sapling => {
            return Err(invalid(txid, "sapling is not active"));
        }
        _ => {}
    }
    if !sapling && tx.serialized_size() > MAX_TX_SIZE_BEFORE_SAPLING as usize {
        return Err(invalid(txid, "transaction too large"));
    }
    if is_expired(tx, height) {
        return Err(ConsensusViolation::Expired(*txid));
    }
    if !is_final(tx, height, block_time) {
        return Err(ConsensusViolation::NonFinal(*txid));
    }
    Ok(())
}

fn is_expired(tx: &Transaction, height: i32) -> bool {
    if !tx.overwintered || tx.expiry_height == 0 || tx.is_coinbase() {
        return false;
    }
    u32::try_from(height).is_ok_and(|height| height > tx.expiry_height)
}

fn is_final(tx: &Transaction, height: i32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        i64::from(block_time)
    };
    if i64::from(tx.lock_time) < limit {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == u32::MAX)
}

/// Inputs consumed by one transaction and the fee they leave.
#[derive(Clone, Debug)]
pub struct ConnectedInputs {
    pub spent: Vec<SpentOutput>,
    pub value_in: i64,
    pub fee: i64,
}

/// Spends the transparent inputs of `tx` in `view` and checks values against its outputs.
pub fn spend_inputs<P: CoinsView + ?Sized>(
    view: &mut UtxoOverlay<'_, P>,
    tx: &Transaction,
    txid: &Hash256,
    spend_height: i32,
    params: &ConsensusParams,
) -> Result<ConnectedInputs, ValidationError> {
    let mut spent = Vec::with_capacity(tx.vin.len());
    let mut value_in = 0i64;
    for input in &tx.vin {
        let entry = view.spend(&input.prevout).map_err(|err| match err {
            UtxoError::NotFound(outpoint) => {
                ValidationError::Consensus(ConsensusViolation::MissingInput(outpoint))
            }
            UtxoError::Conflict(outpoint) => {
                ValidationError::Consensus(ConsensusViolation::DuplicateOutput(outpoint))
            }
            UtxoError::Store(err) => ValidationError::Store(err),
        })?;
        if entry.is_coinbase {
            let depth = i64::from(spend_height) - i64::from(entry.height);
            if depth < i64::from(params.coinbase_maturity) {
                return Err(ConsensusViolation::PrematureCoinbaseSpend {
                    outpoint: input.prevout.clone(),
                    depth,
                }
                .into());
            }
        }
        value_in = value_in
            .checked_add(entry.value)
            .filter(|total| money_range(*total))
            .ok_or(ConsensusViolation::ValueOutOfRange(*txid))?;
        spent.push(SpentOutput {
            outpoint: input.prevout.clone(),
            entry,
        });
    }

    let shielded_in = tx
        .shielded_value_in()
        .ok_or(ConsensusViolation::ValueOutOfRange(*txid))?;
    let value_out = tx
        .value_out()
        .ok_or(ConsensusViolation::ValueOutOfRange(*txid))?;
    let available = value_in
        .checked_add(shielded_in)
        .ok_or(ConsensusViolation::ValueOutOfRange(*txid))?;
    if available < value_out {
        return Err(ConsensusViolation::InputsBelowOutputs(*txid).into());
    }
    Ok(ConnectedInputs {
        spent,
        value_in,
        fee: available - value_out,
    })
}

/// Registers every output of `tx` in `view`.
pub fn add_outputs<P: CoinsView + ?Sized>(
    view: &mut UtxoOverlay<'_, P>,
    tx: &Transaction,
    txid: &Hash256,
    height: u32,
) -> Result<(), ValidationError> {
    let is_coinbase = tx.is_coinbase();
    for (index, output) in tx.vout.iter().enumerate() {
        let outpoint = OutPoint::new(*txid, index as u32);
        let entry = UtxoEntry {
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            height,
            is_coinbase,
        };
        view.create(outpoint, entry).map_err(|err| match err {
            UtxoError::Conflict(outpoint) | UtxoError::NotFound(outpoint) => {
                ValidationError::Consensus(ConsensusViolation::DuplicateOutput(outpoint))
            }
            UtxoError::Store(err) => ValidationError::Store(err),
        })?;
    }
    Ok(())
}

/// One verification job per transparent input, in input order.
pub fn script_jobs(
    tx: &Arc<Transaction>,
    txid: &Hash256,
    spent: &[SpentOutput],
    flags: ScriptFlags,
    branch_id: u32,
) -> Vec<ScriptJob> {
    spent
        .iter()
        .enumerate()
        .map(|(input_index, spent)| ScriptJob {
            tx: Arc::clone(tx),
            txid: *txid,
            input_index,
            spent: spent.entry.clone(),
            flags,
            branch_id,
        })
        .collect()
}

/// Checks shielded proofs through `oracle`. Without one, shielded components are rejected.
pub fn check_shielded(
    tx: &Transaction,
    txid: &Hash256,
    oracle: Option<(&ParamsSet, &dyn ProofVerifier)>,
) -> Result<(), ConsensusViolation> {
    if !tx.has_shielded_components() {
        return Ok(());
    }
    let (params, verifier) = oracle.ok_or(ConsensusViolation::ShieldedUnverified(*txid))?;
    verify_shielded(tx, params, verifier)
        .map_err(|error| ConsensusViolation::InvalidShielded { txid: *txid, error })
}
