//! Block connection and disconnection against the durable UTXO set and block index.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use zcore_consensus::upgrades::current_epoch_branch_id;
use zcore_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use zcore_primitives::block::{Block, BlockHeader};
use zcore_primitives::outpoint::OutPoint;
use zcore_shielded::{ParamsSet, ProofVerifier};
use zcore_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{BlockIndexEntry, BlockStatus};
use crate::checkqueue::{CheckQueue, CheckQueueError};
use crate::flatfiles::{FlatFileError, FlatFileStore};
use crate::index::{BlockId, ChainIndex, IndexError};
use crate::undo::BlockUndo;
use crate::utxo::{CoinsView, UtxoDelta, UtxoError, UtxoOverlay, UtxoSet};
use crate::validation::{
    add_outputs, check_block_header, check_block_structure, check_shielded, compute_txids,
    contextual_check_transaction, script_jobs, spend_inputs, ConsensusViolation,
    ValidationError, ValidationFlags,
};

#[derive(Debug)]
pub enum ChainStateError {
    Consensus(ConsensusViolation),
    Store(StoreError),
    FlatFile(FlatFileError),
    Index(IndexError),
    /// The script check pool shut down; the block is neither valid nor invalid.
    Cancelled,
    NotTip { tip: Hash256, prev: Hash256 },
    NoTip,
    Corrupt(&'static str),
}

impl ChainStateError {
    pub fn is_consensus(&self) -> bool {
        matches!(self, ChainStateError::Consensus(_))
    }

    /// Storage failures after which chain state integrity cannot be assumed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainStateError::Store(_)
                | ChainStateError::FlatFile(_)
                | ChainStateError::Corrupt(_)
                | ChainStateError::Index(IndexError::Store(_) | IndexError::Corrupt(_))
        )
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Consensus(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Index(err) => write!(f, "{err}"),
            ChainStateError::Cancelled => write!(f, "validation cancelled by shutdown"),
            ChainStateError::NotTip { tip, prev } => write!(
                f,
                "block builds on {} but the tip is {}",
                hash256_to_hex(prev),
                hash256_to_hex(tip)
            ),
            ChainStateError::NoTip => write!(f, "no block is connected"),
            ChainStateError::Corrupt(message) => write!(f, "corrupt chain state: {message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ConsensusViolation> for ChainStateError {
    fn from(err: ConsensusViolation) -> Self {
        ChainStateError::Consensus(err)
    }
}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Consensus(err) => ChainStateError::Consensus(err),
            ValidationError::Store(err) => ChainStateError::Store(err),
        }
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<IndexError> for ChainStateError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::BadBits(err) => ChainStateError::Consensus(ConsensusViolation::BadBits(err)),
            other => ChainStateError::Index(other),
        }
    }
}

/// Result of a successful [`ChainState::connect_block`].
#[derive(Clone, Debug)]
pub struct ConnectedBlock {
    pub id: BlockId,
    pub hash: Hash256,
    pub height: i32,
    pub txids: Vec<Hash256>,
    pub fees: i64,
}

#[derive(Clone, Debug)]
pub struct DisconnectedBlock {
    pub hash: Hash256,
    pub height: i32,
    pub block: Block,
}

struct ShieldedCheck {
    params: ParamsSet,
    verifier: Arc<dyn ProofVerifier>,
}

pub struct ChainState<S> {
    store: Arc<S>,
    utxos: UtxoSet<Arc<S>>,
    index: ChainIndex,
    blocks: FlatFileStore,
    params: ConsensusParams,
    shielded: Option<ShieldedCheck>,
    queue: Arc<CheckQueue>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn open(
        store: Arc<S>,
        blocks_dir: impl Into<PathBuf>,
        params: ConsensusParams,
        queue: Arc<CheckQueue>,
    ) -> Result<Self, ChainStateError> {
        let index = ChainIndex::load(store.as_ref())?;
        let utxos = UtxoSet::open(Arc::clone(&store))?;
        let best = utxos.best_block();
        if best != [0u8; 32] && index.lookup(&best).is_none() {
            return Err(ChainStateError::Corrupt("utxo best block is not indexed"));
        }
        let blocks = FlatFileStore::open(blocks_dir)?;
        let state = Self {
            store,
            utxos,
            index,
            blocks,
            params,
            shielded: None,
            queue,
        };
        zcore_log::log_info!(
            "chain state opened: {} indexed blocks, tip height {}",
            state.index.len(),
            state.tip_height()
        );
        Ok(state)
    }

    /// Enables shielded proof checks. Without a verifier, shielded transactions are rejected.
    pub fn set_proof_verifier(&mut self, params: ParamsSet, verifier: Arc<dyn ProofVerifier>) {
        self.shielded = Some(ShieldedCheck { params, verifier });
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The durable base view, readable as a parent for overlays.
    pub fn utxos(&self) -> &UtxoSet<Arc<S>> {
        &self.utxos
    }

    pub fn utxos_mut(&mut self) -> &mut UtxoSet<Arc<S>> {
        &mut self.utxos
    }

    pub fn proof_verifier(&self) -> Option<(&ParamsSet, &dyn ProofVerifier)> {
        self.shielded
            .as_ref()
            .map(|check| (&check.params, check.verifier.as_ref()))
    }

    pub fn queue(&self) -> &Arc<CheckQueue> {
        &self.queue
    }

    /// The block the UTXO set reflects.
    pub fn tip(&self) -> Option<BlockId> {
        self.index.lookup(&self.utxos.best_block())
    }

    pub fn tip_entry(&self) -> Option<&BlockIndexEntry> {
        self.tip().and_then(|id| self.index.entry(id))
    }

    /// Height of the tip, or -1 before genesis is connected.
    pub fn tip_height(&self) -> i32 {
        self.tip_entry().map_or(-1, |entry| entry.height)
    }

    /// Branch id for a transaction mined on top of the tip.
    pub fn next_branch_id(&self) -> u32 {
        current_epoch_branch_id(self.tip_height() + 1, &self.params.upgrades)
    }

    /// Indexes a header without its block.
    pub fn accept_header(&mut self, header: &BlockHeader) -> Result<BlockId, ChainStateError> {
        check_block_header(header, &self.params)?;
        Ok(self.index.add_header(self.store.as_ref(), header)?)
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let Some(location) = self.index.get(hash).and_then(|entry| entry.location) else {
            return Ok(None);
        };
        let bytes = self.blocks.read(location)?;
        let block =
            Block::deserialize(&bytes).map_err(|_| ChainStateError::Corrupt("block payload"))?;
        Ok(Some(block))
    }

    /// Validates `block` on top of the tip and commits it. Only extends the current tip.
    pub fn connect_block(
        &mut self,
        block: &Block,
        flags: ValidationFlags,
    ) -> Result<ConnectedBlock, ChainStateError> {
        let started = Instant::now();
        let tip = self.utxos.best_block();
        if block.header.prev_block != tip {
            return Err(ChainStateError::NotTip {
                tip,
                prev: block.header.prev_block,
            });
        }
        check_block_header(&block.header, &self.params)?;
        let hash = block.header.hash();
        let txids = compute_txids(block);
        let structure = check_block_structure(block, &txids);
        if let Err(err) = &structure {
            if err.is_corruption_possible() {
                zcore_log::log_warn!(
                    "body received for block {} does not match its header: {err}",
                    hash256_to_hex(&hash)
                );
                return Err(ChainStateError::Consensus(err.clone()));
            }
        }

        let id = self.index.add_header(self.store.as_ref(), &block.header)?;
        let entry = self
            .index
            .entry(id)
            .ok_or(ChainStateError::Corrupt("index entry vanished"))?;
        if entry.status.is_failed() {
            let parent_failed = self
                .index
                .get(&block.header.prev_block)
                .is_some_and(|parent| parent.status.is_failed());
            return Err(if parent_failed {
                ConsensusViolation::FailedParent(block.header.prev_block)
            } else {
                ConsensusViolation::KnownInvalid(hash)
            }
            .into());
        }
        let height = entry.height;
        let needs_status = entry.status < BlockStatus::ScriptValid;
        let has_data = entry.location.is_some();

        let checked = structure.map_err(ChainStateError::from).and_then(|()| {
            if !has_data {
                let location = self.blocks.append(&block.serialize())?;
                self.index
                    .set_data_location(self.store.as_ref(), id, location)?;
            }
            check_block(
                &mut self.utxos,
                block,
                &hash,
                txids,
                height,
                &self.params,
                self.shielded.as_ref(),
                flags,
                &self.queue,
            )
        });
        let (delta, undo, txids, fees) = match checked {
            Ok(checked) => checked,
            Err(err) => {
                if err.is_consensus() {
                    zcore_log::log_warn!(
                        "block {} at height {height} is invalid: {err}",
                        hash256_to_hex(&hash)
                    );
                    self.index.mark_failed(self.store.as_ref(), id)?;
                }
                return Err(err);
            }
        };

        let mut batch = WriteBatch::new();
        delta.stage(&mut batch);
        undo.stage(&hash, &mut batch);
        let staged = if needs_status {
            self.index
                .stage_status(id, BlockStatus::ScriptValid, None, &mut batch)?
        } else {
            None
        };
        self.store.write_batch(&batch)?;
        self.utxos.mark_committed(&delta);
        if let Some(staged) = staged {
            self.index.commit_status(staged);
        }

        zcore_log::log_info!(
            "connected block {} height {height} ({} txs, {} utxo changes, {:?})",
            hash256_to_hex(&hash),
            txids.len(),
            delta.len(),
            started.elapsed()
        );
        Ok(ConnectedBlock {
            id,
            hash,
            height,
            txids,
            fees,
        })
    }

    /// Rolls the UTXO set back to the parent of the tip. Index status is unchanged.
    pub fn disconnect_tip(&mut self) -> Result<DisconnectedBlock, ChainStateError> {
        let id = self.tip().ok_or(ChainStateError::NoTip)?;
        let entry = self
            .index
            .entry(id)
            .ok_or(ChainStateError::Corrupt("tip entry"))?
            .clone();
        let block = self
            .read_block(&entry.hash)?
            .ok_or(ChainStateError::Corrupt("tip has no block data"))?;
        let undo_bytes = self
            .store
            .get(Column::BlockUndo, &entry.hash)?
            .ok_or(ChainStateError::Corrupt("tip has no undo data"))?;
        let undo =
            BlockUndo::decode(&undo_bytes).map_err(|_| ChainStateError::Corrupt("undo record"))?;

        let mut overlay = UtxoOverlay::new(&mut self.utxos);
        let mut restore = undo.spent.len();
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for index in 0..tx.vout.len() {
                overlay
                    .spend(&OutPoint::new(txid, index as u32))
                    .map_err(|err| disconnect_error(err, "block output missing"))?;
            }
            if tx.is_coinbase() {
                continue;
            }
            let start = restore
                .checked_sub(tx.vin.len())
                .ok_or(ChainStateError::Corrupt("undo record too short"))?;
            for spent in &undo.spent[start..restore] {
                overlay
                    .create(spent.outpoint.clone(), spent.entry.clone())
                    .map_err(|err| disconnect_error(err, "restored output already present"))?;
            }
            restore = start;
        }
        if restore != 0 {
            return Err(ChainStateError::Corrupt("undo record too long"));
        }
        overlay.set_best_block(entry.prev);
        let delta = overlay.into_delta();

        let mut batch = WriteBatch::new();
        delta.stage(&mut batch);
        batch.delete(Column::BlockUndo, entry.hash);
        self.store.write_batch(&batch)?;
        self.utxos.mark_committed(&delta);

        zcore_log::log_info!(
            "disconnected block {} height {}",
            hash256_to_hex(&entry.hash),
            entry.height
        );
        Ok(DisconnectedBlock {
            hash: entry.hash,
            height: entry.height,
            block,
        })
    }
}

fn disconnect_error(err: UtxoError, message: &'static str) -> ChainStateError {
    match err {
        UtxoError::Store(err) => ChainStateError::Store(err),
        UtxoError::NotFound(_) | UtxoError::Conflict(_) => ChainStateError::Corrupt(message),
    }
}

/// Runs the contextual checks of a structurally valid `block` through an overlay on `utxos` and returns the staged changes.
#[allow(clippy::too_many_arguments)]
fn check_block<P: CoinsView + ?Sized>(
    utxos: &mut P,
    block: &Block,
    hash: &Hash256,
    txids: Vec<Hash256>,
    height: i32,
    params: &ConsensusParams,
    shielded: Option<&ShieldedCheck>,
    flags: ValidationFlags,
    queue: &CheckQueue,
) -> Result<(UtxoDelta, BlockUndo, Vec<Hash256>, i64), ChainStateError> {

    let spend_height = u32::try_from(height).map_err(|_| ChainStateError::Corrupt("height"))?;
    let branch_id = current_epoch_branch_id(height, &params.upgrades);
    let mut overlay = UtxoOverlay::new(utxos);
    let mut undo = BlockUndo::default();
    let mut jobs = Vec::new();
    let mut fees = 0i64;

    for (tx, txid) in block.transactions.iter().zip(&txids) {
        contextual_check_transaction(tx, txid, height, block.header.time, params)?;
        if !tx.is_coinbase() {
            let connected = spend_inputs(&mut overlay, tx, txid, height, params)?;
            fees = fees
                .checked_add(connected.fee)
                .ok_or(ConsensusViolation::ValueOutOfRange(*txid))?;
            if flags.check_scripts {
                let shared = Arc::new(tx.clone());
                jobs.extend(script_jobs(
                    &shared,
                    txid,
                    &connected.spent,
                    flags.script_flags,
                    branch_id,
                ));
            }
            undo.spent.extend(connected.spent);
        }
        check_shielded(
            tx,
            txid,
            shielded.map(|check| (&check.params, check.verifier.as_ref())),
        )?;
        add_outputs(&mut overlay, tx, txid, spend_height)?;
    }

    match queue.verify_all(jobs) {
        Ok(()) => {}
        Err(CheckQueueError::Failed(failure)) => {
            return Err(ConsensusViolation::InvalidScript(failure).into())
        }
        Err(CheckQueueError::Cancelled) => return Err(ChainStateError::Cancelled),
    }

    overlay.set_best_block(*hash);
    Ok((overlay.into_delta(), undo, txids, fees))
}
