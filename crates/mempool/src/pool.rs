use std::collections::{HashMap, HashSet};

use zcore_chainstate::utxo::{CoinsView, UtxoEntry};
use zcore_consensus::{hash256_to_hex, Hash256};
use zcore_primitives::block::Block;
use zcore_primitives::outpoint::OutPoint;
use zcore_primitives::transaction::Transaction;
use zcore_storage::StoreError;

use crate::entry::MempoolEntry;
use crate::{MempoolError, MEMPOOL_HEIGHT};

/// Transactions displaced to make room for an insertion.
#[derive(Clone, Debug, Default)]
pub struct InsertOutcome {
    pub evicted: Vec<Hash256>,
    pub evicted_bytes: usize,
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    nullifiers: HashMap<Hash256, Hash256>,
    children: HashMap<Hash256, Vec<Hash256>>,
    total_bytes: usize,
    /// Zero disables the limit.
    max_bytes: usize,
}

impl Mempool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn nullifier_spender(&self, nullifier: &Hash256) -> Option<Hash256> {
        self.nullifiers.get(nullifier).copied()
    }

    /// True when no input of `tx` spends an output of a pool transaction.
    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        tx.vin
            .iter()
            .all(|input| !self.entries.contains_key(&input.prevout.hash))
    }

    /// Pool outputs layered over `parent`, for resolving inputs of dependent transactions.
    pub fn coins_view<'a, P: CoinsView + ?Sized>(&'a self, parent: &'a P) -> PoolCoins<'a, P> {
        PoolCoins { pool: self, parent }
    }

    /// Adds `entry`, then evicts by ascending fee rate until the pool fits its limit.
    pub fn insert(&mut self, entry: MempoolEntry) -> Result<InsertOutcome, MempoolError> {
        let txid = entry.txid;
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyInMempool(txid));
        }
        if self.max_bytes > 0 && entry.size > self.max_bytes {
            return Err(MempoolError::MempoolFull);
        }
        for outpoint in &entry.spent_outpoints {
            if let Some(spender) = self.spent.get(outpoint) {
                return Err(MempoolError::ConflictingInput {
                    outpoint: outpoint.clone(),
                    spender: *spender,
                });
            }
        }
        for nullifier in tx_nullifiers(&entry.tx) {
            if let Some(spender) = self.nullifiers.get(nullifier) {
                return Err(MempoolError::ConflictingNullifier {
                    nullifier: *nullifier,
                    spender: *spender,
                });
            }
        }

        for outpoint in &entry.spent_outpoints {
            self.spent.insert(outpoint.clone(), txid);
        }
        for nullifier in tx_nullifiers(&entry.tx) {
            self.nullifiers.insert(*nullifier, txid);
        }
        for parent in &entry.parents {
            let children = self.children.entry(*parent).or_default();
            if !children.contains(&txid) {
                children.push(txid);
            }
        }
        self.total_bytes += entry.size;
        self.entries.insert(txid, entry);

        let outcome = if self.max_bytes > 0 && self.total_bytes > self.max_bytes {
            self.evict_to_fit()
        } else {
            InsertOutcome::default()
        };
        if !self.entries.contains_key(&txid) {
            return Err(MempoolError::MempoolFull);
        }
        Ok(outcome)
    }

    /// Removes `txid` and every in-pool descendant, children first.
    pub fn remove(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(*txid, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.push((current, true));
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().map(|child| (*child, false)));
            }
        }
        order
            .into_iter()
            .filter_map(|txid| self.remove_one(&txid))
            .collect()
    }

    /// Drops transactions mined in `block` and everything that conflicts with them.
    pub fn remove_for_block(&mut self, block: &Block) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            if let Some(entry) = self.remove_one(&txid) {
                removed.push(entry);
            }
            for input in &tx.vin {
                if let Some(spender) = self.spent.get(&input.prevout).copied() {
                    removed.extend(self.remove(&spender));
                }
            }
            for nullifier in tx_nullifiers(tx) {
                if let Some(spender) = self.nullifiers.get(nullifier).copied() {
                    removed.extend(self.remove(&spender));
                }
            }
        }
        if !removed.is_empty() {
            zcore_log::log_debug!(
                "mempool: removed {} transactions for block {}",
                removed.len(),
                hash256_to_hex(&block.hash())
            );
        }
        removed
    }

    /// Entries by descending fee rate, each preceded by its in-pool ancestors.
    pub fn block_candidates(&self) -> Vec<&MempoolEntry> {
        let mut ranked: Vec<&MempoolEntry> = self.entries.values().collect();
        ranked.sort_by(|a, b| {
            b.cmp_fee_rate(a)
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.txid.cmp(&b.txid))
        });

        let mut emitted = HashSet::with_capacity(ranked.len());
        let mut ordered = Vec::with_capacity(ranked.len());
        for entry in ranked {
            let mut stack = vec![(entry, false)];
            while let Some((current, expanded)) = stack.pop() {
                if emitted.contains(&current.txid) {
                    continue;
                }
                if expanded {
                    emitted.insert(current.txid);
                    ordered.push(current);
                    continue;
                }
                stack.push((current, true));
                for parent in current.parents.iter().rev() {
                    if let Some(parent) = self.entries.get(parent) {
                        stack.push((parent, false));
                    }
                }
            }
        }
        ordered
    }

    fn remove_one(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for outpoint in &entry.spent_outpoints {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        for nullifier in tx_nullifiers(&entry.tx) {
            if self.nullifiers.get(nullifier) == Some(txid) {
                self.nullifiers.remove(nullifier);
            }
        }
        for parent in &entry.parents {
            if let Some(children) = self.children.get_mut(parent) {
                children.retain(|child| child != txid);
                if children.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(child) = self.entries.get_mut(&child) {
                    child.parents.retain(|parent| parent != txid);
                }
            }
        }
        Some(entry)
    }

    fn evict_to_fit(&mut self) -> InsertOutcome {
        let mut ranked: Vec<(Hash256, i64, usize, u64)> = self
            .entries
            .values()
            .map(|entry| (entry.txid, entry.fee, entry.size.max(1), entry.time))
            .collect();
        ranked.sort_by(|a, b| {
            let left = i128::from(a.1) * b.2 as i128;
            let right = i128::from(b.1) * a.2 as i128;
            left.cmp(&right)
                .then_with(|| a.3.cmp(&b.3))
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut outcome = InsertOutcome::default();
        for (txid, ..) in ranked {
            if self.total_bytes <= self.max_bytes {
                break;
            }
            for entry in self.remove(&txid) {
                outcome.evicted_bytes += entry.size;
                outcome.evicted.push(entry.txid);
            }
        }
        zcore_log::log_debug!(
            "mempool: evicted {} transactions ({} bytes)",
            outcome.evicted.len(),
            outcome.evicted_bytes
        );
        outcome
    }
}

fn tx_nullifiers(tx: &Transaction) -> impl Iterator<Item = &Hash256> {
    tx.join_splits
        .iter()
        .flat_map(|js| js.nullifiers.iter())
        .chain(tx.shielded_spends.iter().map(|spend| &spend.nullifier))
}

/// Pool outputs over a parent view. Outputs already spent by another pool transaction stay
/// visible; conflicts are rejected by [`Mempool::insert`].
pub struct PoolCoins<'a, P: ?Sized> {
    pool: &'a Mempool,
    parent: &'a P,
}

impl<P: CoinsView + ?Sized> CoinsView for PoolCoins<'_, P> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        if let Some(entry) = self.pool.entries.get(&outpoint.hash) {
            let output = usize::try_from(outpoint.index)
                .ok()
                .and_then(|index| entry.tx.vout.get(index));
            return Ok(output.map(|output| UtxoEntry {
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                height: MEMPOOL_HEIGHT,
                is_coinbase: false,
            }));
        }
        self.parent.coin(outpoint)
    }

    fn best_block(&self) -> Hash256 {
        self.parent.best_block()
    }
}

#[cfg(test)]
mod tests {
    use zcore_primitives::block::BlockHeader;
    use zcore_primitives::transaction::{SpendDescription, TxIn, TxOut, GROTH_PROOF_SIZE};

    use super::*;

    fn tx(prevouts: &[OutPoint], outputs: usize, tag: u8) -> Transaction {
        let mut tx = Transaction::default();
        tx.vin = prevouts
            .iter()
            .map(|prevout| TxIn {
                prevout: prevout.clone(),
                script_sig: vec![tag],
                sequence: u32::MAX,
            })
            .collect();
        tx.vout = (0..outputs)
            .map(|_| TxOut {
                value: 1_000,
                script_pubkey: vec![0x51],
            })
            .collect();
        tx
    }

    fn entry(tx: Transaction, fee: i64, size: usize, pool: &Mempool) -> MempoolEntry {
        let parents = {
            let mut parents: Vec<Hash256> = tx
                .vin
                .iter()
                .map(|input| input.prevout.hash)
                .filter(|hash| pool.contains(hash))
                .collect();
            parents.sort();
            parents.dedup();
            parents
        };
        MempoolEntry {
            txid: tx.txid(),
            size,
            fee,
            value_in: 0,
            time: 0,
            height: 1,
            priority: 0.0,
            modified_size: size,
            spends_coinbase: false,
            no_unconfirmed_parents: parents.is_empty(),
            branch_id: 0,
            spent_outpoints: tx.vin.iter().map(|input| input.prevout.clone()).collect(),
            parents,
            tx,
        }
    }

    fn confirmed(tag: u8) -> OutPoint {
        OutPoint::new([tag; 32], 0)
    }

    #[test]
    fn conflicting_spend_is_rejected() {
        let mut pool = Mempool::new(0);
        let first = entry(tx(&[confirmed(1)], 1, 1), 10, 100, &pool);
        let first_txid = first.txid;
        pool.insert(first).expect("insert");
        let second = entry(tx(&[confirmed(1)], 1, 2), 50, 100, &pool);
        match pool.insert(second) {
            Err(MempoolError::ConflictingInput { spender, .. }) => assert_eq!(spender, first_txid),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.bytes(), 100);
    }

    #[test]
    fn shared_nullifier_is_a_conflict() {
        let nullifier = [5u8; 32];
        let shielded = |tag: u8| {
            let mut tx = tx(&[confirmed(tag)], 1, tag);
            tx.shielded_spends.push(SpendDescription {
                cv: [0u8; 32],
                anchor: [0u8; 32],
                nullifier,
                rk: [0u8; 32],
                zkproof: [0u8; GROTH_PROOF_SIZE],
                spend_auth_sig: [0u8; 64],
            });
            tx
        };
        let mut pool = Mempool::new(0);
        let first = entry(shielded(1), 10, 100, &pool);
        let first_txid = first.txid;
        pool.insert(first).expect("insert");
        assert_eq!(pool.nullifier_spender(&nullifier), Some(first_txid));

        match pool.insert(entry(shielded(2), 50, 100, &pool)) {
            Err(MempoolError::ConflictingNullifier { spender, .. }) => {
                assert_eq!(spender, first_txid)
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(pool.remove(&first_txid).len(), 1);
        assert!(pool.nullifier_spender(&nullifier).is_none());
    }

    #[test]
    fn removing_a_parent_takes_its_descendants() {
        let mut pool = Mempool::new(0);
        let parent = entry(tx(&[confirmed(1)], 2, 1), 10, 100, &pool);
        let parent_txid = parent.txid;
        pool.insert(parent).expect("insert parent");
        let child = entry(tx(&[OutPoint::new(parent_txid, 0)], 1, 2), 10, 100, &pool);
        assert!(!child.no_unconfirmed_parents);
        let child_txid = child.txid;
        pool.insert(child).expect("insert child");
        let grandchild = entry(tx(&[OutPoint::new(child_txid, 0)], 1, 3), 10, 100, &pool);
        pool.insert(grandchild).expect("insert grandchild");
        let unrelated = entry(tx(&[confirmed(2)], 1, 4), 10, 100, &pool);
        pool.insert(unrelated).expect("insert unrelated");

        let removed = pool.remove(&parent_txid);
        assert_eq!(removed.len(), 3);
        assert_eq!(removed.last().map(|entry| entry.txid), Some(parent_txid));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.bytes(), 100);
        assert!(pool.spender(&confirmed(1)).is_none());
    }

    #[test]
    fn eviction_drops_lowest_fee_rate_with_descendants() {
        let mut pool = Mempool::new(300);
        let cheap = entry(tx(&[confirmed(1)], 1, 1), 1, 100, &pool);
        let cheap_txid = cheap.txid;
        pool.insert(cheap).expect("insert cheap");
        let child = entry(tx(&[OutPoint::new(cheap_txid, 0)], 1, 2), 500, 100, &pool);
        let child_txid = child.txid;
        pool.insert(child).expect("insert child");
        let rich = entry(tx(&[confirmed(2)], 1, 3), 100, 100, &pool);
        pool.insert(rich).expect("insert rich");

        let newcomer = entry(tx(&[confirmed(3)], 1, 4), 200, 100, &pool);
        let outcome = pool.insert(newcomer).expect("insert newcomer");
        assert_eq!(outcome.evicted.len(), 2);
        assert!(outcome.evicted.contains(&cheap_txid));
        assert!(outcome.evicted.contains(&child_txid));
        assert_eq!(pool.bytes(), 200);

        let poor = entry(tx(&[confirmed(4)], 1, 5), 0, 200, &pool);
        assert!(matches!(pool.insert(poor), Err(MempoolError::MempoolFull)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn candidates_put_parents_first() {
        let mut pool = Mempool::new(0);
        let parent = entry(tx(&[confirmed(1)], 1, 1), 1, 100, &pool);
        let parent_txid = parent.txid;
        pool.insert(parent).expect("insert parent");
        let child = entry(tx(&[OutPoint::new(parent_txid, 0)], 1, 2), 1_000, 100, &pool);
        let child_txid = child.txid;
        pool.insert(child).expect("insert child");
        let middle = entry(tx(&[confirmed(2)], 1, 3), 50, 100, &pool);
        let middle_txid = middle.txid;
        pool.insert(middle).expect("insert middle");

        let order: Vec<Hash256> = pool
            .block_candidates()
            .into_iter()
            .map(|entry| entry.txid)
            .collect();
        assert_eq!(order, vec![parent_txid, child_txid, middle_txid]);
    }

    #[test]
    fn mined_block_clears_included_and_conflicting() {
        let mut pool = Mempool::new(0);
        let included = tx(&[confirmed(1)], 1, 1);
        pool.insert(entry(included.clone(), 10, 100, &pool))
            .expect("insert");
        let doomed = entry(tx(&[confirmed(2)], 1, 2), 10, 100, &pool);
        let doomed_txid = doomed.txid;
        pool.insert(doomed).expect("insert");
        let survivor = entry(tx(&[confirmed(3)], 1, 3), 10, 100, &pool);
        let survivor_txid = survivor.txid;
        pool.insert(survivor).expect("insert");

        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                final_sapling_root: [0u8; 32],
                time: 0,
                bits: 0x200f_0f0f,
                nonce: [0u8; 32],
                solution: Vec::new(),
            },
            transactions: vec![included, tx(&[confirmed(2)], 1, 9)],
        };
        let removed: HashSet<Hash256> = pool
            .remove_for_block(&block)
            .into_iter()
            .map(|entry| entry.txid)
            .collect();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&doomed_txid));
        assert!(pool.contains(&survivor_txid));
        assert!(pool.spender(&confirmed(2)).is_none());
    }

    #[test]
    fn pool_outputs_resolve_through_the_view() {
        struct Empty;
        impl CoinsView for Empty {
            fn coin(&self, _: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
                Ok(None)
            }
            fn best_block(&self) -> Hash256 {
                [7u8; 32]
            }
        }

        let mut pool = Mempool::new(0);
        let parent = entry(tx(&[confirmed(1)], 2, 1), 10, 100, &pool);
        let parent_txid = parent.txid;
        pool.insert(parent).expect("insert");
        let view = pool.coins_view(&Empty);
        let coin = view
            .coin(&OutPoint::new(parent_txid, 1))
            .expect("read")
            .expect("pool output");
        assert_eq!(coin.height, MEMPOOL_HEIGHT);
        assert_eq!(coin.value, 1_000);
        assert!(view.coin(&OutPoint::new(parent_txid, 2)).expect("read").is_none());
        assert_eq!(view.best_block(), [7u8; 32]);
    }
}
