//! The validation context: one object owning chain state, the mempool and the observer
//! registry, passed to every validation entry point.
//!
//! A single validation lock serialises every mutation of chain or pool state. Observers are
//! notified while that lock is held, so they must not call back into the context.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use zcore_chainstate::blockindex::BlockIndexEntry;
use zcore_chainstate::utxo::{UtxoEntry, UtxoOverlay};
use zcore_chainstate::validation::{
    check_shielded, check_transaction, contextual_check_transaction, script_jobs, spend_inputs,
};
use zcore_chainstate::{
    ChainState, ChainStateError, CheckQueue, CheckQueueError, ConnectedBlock, ConsensusViolation,
    DisconnectedBlock, ValidationError, ValidationFlags,
};
use zcore_consensus::{hash256_to_hex, Hash256};
use zcore_mempool::{make_entry, Mempool, MempoolEntry, MempoolError, MempoolPolicy};
use zcore_primitives::block::Block;
use zcore_primitives::transaction::Transaction;
use zcore_storage::KeyValueStore;

use crate::notify::{NotificationError, ValidationObserver, ValidationRegistry};

/// A state change that was committed before its notifications failed.
#[derive(Clone, Debug)]
pub enum Committed {
    Connected(ConnectedBlock),
    Disconnected(DisconnectedBlock),
    Accepted(Hash256),
}

#[derive(Debug)]
pub enum ContextError {
    Chain(ChainStateError),
    Mempool(MempoolError),
    /// The change is committed; only its observers failed.
    Notification {
        committed: Box<Committed>,
        error: NotificationError,
    },
    ShuttingDown,
}

impl ContextError {
    pub fn is_consensus(&self) -> bool {
        matches!(self, ContextError::Chain(err) if err.is_consensus())
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            ContextError::Chain(err) => err.is_fatal(),
            ContextError::Mempool(MempoolError::Store(_)) => true,
            _ => false,
        }
    }

    pub fn committed(&self) -> Option<&Committed> {
        match self {
            ContextError::Notification { committed, .. } => Some(committed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextError::Chain(err) => write!(f, "{err}"),
            ContextError::Mempool(err) => write!(f, "{err}"),
            ContextError::Notification { error, .. } => {
                write!(f, "committed, but notification failed: {error}")
            }
            ContextError::ShuttingDown => write!(f, "validation is shutting down"),
        }
    }
}

impl std::error::Error for ContextError {}

impl From<ChainStateError> for ContextError {
    fn from(err: ChainStateError) -> Self {
        ContextError::Chain(err)
    }
}

impl From<ConsensusViolation> for ContextError {
    fn from(err: ConsensusViolation) -> Self {
        ContextError::Chain(ChainStateError::Consensus(err))
    }
}

impl From<ValidationError> for ContextError {
    fn from(err: ValidationError) -> Self {
        ContextError::Chain(err.into())
    }
}

impl From<MempoolError> for ContextError {
    fn from(err: MempoolError) -> Self {
        ContextError::Mempool(err)
    }
}

pub struct ValidationContext<S> {
    chain: Mutex<ChainState<S>>,
    mempool: RwLock<Mempool>,
    policy: MempoolPolicy,
    registry: ValidationRegistry,
    queue: Arc<CheckQueue>,
    stopping: AtomicBool,
}

impl<S: KeyValueStore> ValidationContext<S> {
    pub fn new(chain: ChainState<S>, mempool: Mempool, policy: MempoolPolicy) -> Self {
        let queue = Arc::clone(chain.queue());
        Self {
            chain: Mutex::new(chain),
            mempool: RwLock::new(mempool),
            policy,
            registry: ValidationRegistry::new(),
            queue,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn register(&self, observer: Arc<dyn ValidationObserver>) -> bool {
        self.registry.register(observer)
    }

    pub fn unregister(&self, observer: &Arc<dyn ValidationObserver>) -> bool {
        self.registry.unregister(observer)
    }

    /// Read access to the pool. May trail an in-flight validation.
    pub fn mempool(&self) -> RwLockReadGuard<'_, Mempool> {
        self.mempool.read().expect("mempool lock")
    }

    /// Runs `f` against chain state under the validation lock.
    pub fn with_chain<R>(&self, f: impl FnOnce(&ChainState<S>) -> R) -> R {
        f(&self.chain.lock().expect("validation lock"))
    }

    /// The block the UTXO set reflects.
    pub fn tip(&self) -> Option<BlockIndexEntry> {
        self.with_chain(|chain| chain.tip_entry().cloned())
    }

    /// The fully validated entry with the most chain work.
    pub fn best_tip(&self) -> Option<BlockIndexEntry> {
        self.with_chain(|chain| {
            let index = chain.index();
            index.best_tip().and_then(|id| index.entry(id)).cloned()
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn connect_block(&self, block: &Block) -> Result<ConnectedBlock, ContextError> {
        let mut chain = self.lock_chain()?;
        let connected = chain.connect_block(block, ValidationFlags::block())?;
        self.mempool
            .write()
            .expect("mempool lock")
            .remove_for_block(block);
        let entry = chain
            .index()
            .entry(connected.id)
            .cloned()
            .ok_or(ChainStateError::Corrupt("connected block is not indexed"))?;
        let error = self.registry.block_connected(block, &entry);
        drop(chain);
        finish(connected, error, Committed::Connected)
    }

    /// Rolls back the tip and returns its transactions to the pool where they still fit.
    pub fn disconnect_tip(&self) -> Result<DisconnectedBlock, ContextError> {
        let mut chain = self.lock_chain()?;
        let disconnected = chain.disconnect_tip()?;
        let mut error = self.registry.block_disconnected(&disconnected.block);
        error.merge(self.requeue(&chain, &disconnected.block));
        drop(chain);
        finish(disconnected, error, Committed::Disconnected)
    }

    /// Validates `tx` against the tip plus the pool and admits it. The durable UTXO set is
    /// never modified.
    pub fn accept_to_mempool(&self, tx: Transaction, time: u64) -> Result<Hash256, ContextError> {
        let chain = self.lock_chain()?;
        let entry = self.check_for_pool(&chain, tx, time)?;
        let txid = entry.txid;
        let error = self.insert_and_notify(entry)?;
        drop(chain);
        finish(txid, error, Committed::Accepted)
    }

    /// Stops accepting work, waits for the validation in flight, then stops script workers.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        let first = !self.stopping.swap(true, Ordering::AcqRel);
        let _chain = self.chain.lock().expect("validation lock");
        self.queue.shutdown();
        self.registry.unregister_all();
        if first {
            zcore_log::log_info!("validation context shut down");
        }
    }

    fn lock_chain(&self) -> Result<MutexGuard<'_, ChainState<S>>, ContextError> {
        if self.is_shutting_down() {
            return Err(ContextError::ShuttingDown);
        }
        let chain = self.chain.lock().expect("validation lock");
        // Shutdown may have begun while waiting for the lock.
        if self.is_shutting_down() {
            return Err(ContextError::ShuttingDown);
        }
        Ok(chain)
    }

    fn check_for_pool(
        &self,
        chain: &ChainState<S>,
        tx: Transaction,
        time: u64,
    ) -> Result<MempoolEntry, ContextError> {
        self.policy.check_transaction(&tx)?;
        let txid = tx.txid();
        let params = chain.params();
        let tip_height = chain.tip_height();
        let height = tip_height + 1;
        let branch_id = chain.next_branch_id();

        let mempool = self.mempool.read().expect("mempool lock");
        if mempool.contains(&txid) {
            return Err(MempoolError::AlreadyInMempool(txid).into());
        }
        for input in &tx.vin {
            if let Some(spender) = mempool.spender(&input.prevout) {
                return Err(MempoolError::ConflictingInput {
                    outpoint: input.prevout.clone(),
                    spender,
                }
                .into());
            }
        }
        check_transaction(&tx, &txid)?;
        let block_time = u32::try_from(time).unwrap_or(u32::MAX);
        contextual_check_transaction(&tx, &txid, height, block_time, params)?;

        let mut pool_view = mempool.coins_view(chain.utxos());
        let entry = make_entry(tx, &pool_view, &mempool, tip_height, time, branch_id)?;
        let connected = {
            let mut overlay = UtxoOverlay::new(&mut pool_view);
            spend_inputs(&mut overlay, &entry.tx, &txid, height, params)?
        };
        let spent: Vec<UtxoEntry> = connected
            .spent
            .iter()
            .map(|spent| spent.entry.clone())
            .collect();
        self.policy.check_inputs(&entry.tx, &spent)?;
        self.policy.check_fee(&entry)?;
        check_shielded(&entry.tx, &txid, chain.proof_verifier())?;

        let shared = Arc::new(entry.tx.clone());
        let jobs = script_jobs(
            &shared,
            &txid,
            &connected.spent,
            ValidationFlags::standard().script_flags,
            branch_id,
        );
        match self.queue.verify_all(jobs) {
            Ok(()) => Ok(entry),
            Err(CheckQueueError::Failed(failure)) => {
                Err(ConsensusViolation::InvalidScript(failure).into())
            }
            Err(CheckQueueError::Cancelled) => Err(ChainStateError::Cancelled.into()),
        }
    }

    fn insert_and_notify(&self, entry: MempoolEntry) -> Result<NotificationError, MempoolError> {
        let outcome = self
            .mempool
            .write()
            .expect("mempool lock")
            .insert(entry.clone())?;
        if !outcome.evicted.is_empty() {
            zcore_log::log_debug!(
                "mempool: accepting {} evicted {} transactions",
                hash256_to_hex(&entry.txid),
                outcome.evicted.len()
            );
        }
        Ok(self.registry.tx_accepted_to_pool(&entry.tx, &entry))
    }

    /// Drops pool entries that spent outputs of `block`, then offers its transactions back.
    fn requeue(&self, chain: &ChainState<S>, block: &Block) -> NotificationError {
        let created: HashSet<Hash256> = block.txids().into_iter().collect();
        {
            let mut mempool = self.mempool.write().expect("mempool lock");
            let dependents: Vec<Hash256> = mempool
                .entries()
                .filter(|entry| {
                    entry
                        .spent_outpoints
                        .iter()
                        .any(|outpoint| created.contains(&outpoint.hash))
                })
                .map(|entry| entry.txid)
                .collect();
            for txid in dependents {
                mempool.remove(&txid);
            }
        }

        let now = now_secs();
        let mut error = NotificationError::default();
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            let txid = tx.txid();
            let accepted = self
                .check_for_pool(chain, tx.clone(), now)
                .and_then(|entry| self.insert_and_notify(entry).map_err(ContextError::from));
            match accepted {
                Ok(failures) => error.merge(failures),
                Err(err) => zcore_log::log_debug!(
                    "not returning {} to the mempool: {err}",
                    hash256_to_hex(&txid)
                ),
            }
        }
        error
    }
}

fn finish<T>(
    value: T,
    error: NotificationError,
    committed: impl FnOnce(T) -> Committed,
) -> Result<T, ContextError> {
    match error.into_result() {
        Ok(()) => Ok(value),
        Err(error) => Err(ContextError::Notification {
            committed: Box::new(committed(value)),
            error,
        }),
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
