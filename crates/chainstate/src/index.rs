//! In-memory block tree backed by the `BlockIndex` column.
//!
//! Every mutation is written to the store before the in-memory tree changes, so the tree never
//! reports a status that was not persisted. Callers that need an index change to land in the
//! same batch as other writes use [`ChainIndex::stage_status`] and [`ChainIndex::commit_status`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;
use smallvec::SmallVec;
use zcore_consensus::{hash256_to_hex, Hash256};
use zcore_pow::difficulty::{block_proof, CompactError};
use zcore_primitives::block::BlockHeader;
use zcore_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{BlockIndexEntry, BlockStatus};
use crate::flatfiles::FileLocation;

pub const META_INDEX_SEQUENCE: &[u8] = b"index_sequence";

/// Position of an entry in the tracker. Stable for the lifetime of the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub enum IndexError {
    UnknownParent(Hash256),
    UnknownBlock(BlockId),
    MultipleGenesis(Hash256),
    BadBits(CompactError),
    Store(StoreError),
    Corrupt(&'static str),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::UnknownParent(hash) => {
                write!(f, "parent block {} is not indexed", hash256_to_hex(hash))
            }
            IndexError::UnknownBlock(id) => write!(f, "no index entry {}", id.0),
            IndexError::MultipleGenesis(hash) => write!(
                f,
                "block {} has no parent but a genesis entry exists",
                hash256_to_hex(hash)
            ),
            IndexError::BadBits(err) => write!(f, "invalid nBits: {err}"),
            IndexError::Store(err) => write!(f, "{err}"),
            IndexError::Corrupt(message) => write!(f, "corrupt block index: {message}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

/// A status change staged into a batch but not yet visible in memory.
#[derive(Debug)]
#[must_use]
pub struct StagedStatus {
    id: BlockId,
    status: BlockStatus,
    location: Option<FileLocation>,
}

#[derive(Default)]
pub struct ChainIndex {
    entries: Vec<BlockIndexEntry>,
    parents: Vec<Option<BlockId>>,
    children: Vec<SmallVec<[BlockId; 2]>>,
    by_hash: HashMap<Hash256, BlockId>,
    /// Fully validated entries, best last.
    candidates: BTreeSet<(U256, Reverse<u64>, BlockId)>,
    genesis: Option<BlockId>,
    next_sequence: u64,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the tree from every persisted entry, in first-seen order.
    pub fn load<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self, IndexError> {
        let mut records = Vec::new();
        for (key, value) in store.scan_prefix(Column::BlockIndex, &[])? {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| IndexError::Corrupt("block index key length"))?;
            let entry = BlockIndexEntry::decode(hash, &value)
                .map_err(|_| IndexError::Corrupt("block index record"))?;
            records.push(entry);
        }
        records.sort_by_key(|entry| entry.sequence);

        let mut index = Self::new();
        for entry in records {
            let parent = if entry.prev == [0u8; 32] {
                None
            } else {
                Some(
                    index
                        .lookup(&entry.prev)
                        .ok_or(IndexError::Corrupt("entry stored before its parent"))?,
                )
            };
            index.next_sequence = index.next_sequence.max(entry.sequence + 1);
            index.insert(entry, parent);
        }
        if let Some(bytes) = store.get(Column::Meta, META_INDEX_SEQUENCE)? {
            let bytes: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| IndexError::Corrupt("index sequence"))?;
            index.next_sequence = index.next_sequence.max(u64::from_le_bytes(bytes));
        }
        zcore_log::log_debug!("loaded {} block index entries", index.len());
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn entry(&self, id: BlockId) -> Option<&BlockIndexEntry> {
        self.entries.get(id.0)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.lookup(hash).and_then(|id| self.entry(id))
    }

    pub fn parent(&self, id: BlockId) -> Option<BlockId> {
        self.parents.get(id.0).copied().flatten()
    }

    pub fn children(&self, id: BlockId) -> &[BlockId] {
        self.children.get(id.0).map_or(&[], |children| children.as_slice())
    }

    /// Entries in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BlockIndexEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (BlockId(index), entry))
    }

    /// The fully validated entry with the most chain-work; the earliest seen wins ties.
    pub fn best_tip(&self) -> Option<BlockId> {
        self.candidates.last().map(|(_, _, id)| *id)
    }

    pub fn ancestor(&self, id: BlockId, height: i32) -> Option<BlockId> {
        let mut current = id;
        let mut entry = self.entry(current)?;
        if height < 0 || height > entry.height {
            return None;
        }
        while entry.height > height {
            current = self.parent(current)?;
            entry = self.entry(current)?;
        }
        Some(current)
    }

    /// Path from genesis to `tip`, inclusive.
    pub fn active_chain(&self, tip: BlockId) -> Vec<BlockId> {
        let mut chain = Vec::new();
        let mut cursor = Some(tip).filter(|id| id.0 < self.entries.len());
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.parent(id);
        }
        chain.reverse();
        chain
    }

    /// Indexes `header`, or returns the existing entry for its hash.
    pub fn add_header<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        header: &BlockHeader,
    ) -> Result<BlockId, IndexError> {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return Ok(id);
        }

        let proof = block_proof(header.bits).map_err(IndexError::BadBits)?;
        let (parent, height, chainwork, status) = if header.is_genesis() {
            if self.genesis.is_some() {
                return Err(IndexError::MultipleGenesis(hash));
            }
            (None, 0, proof, BlockStatus::HeaderOnly)
        } else {
            let parent = self
                .lookup(&header.prev_block)
                .ok_or(IndexError::UnknownParent(header.prev_block))?;
            let parent_entry = &self.entries[parent.0];
            let status = if parent_entry.status.is_failed() {
                BlockStatus::Failed
            } else {
                BlockStatus::HeaderOnly
            };
            (
                Some(parent),
                parent_entry.height + 1,
                parent_entry.chainwork.saturating_add(proof),
                status,
            )
        };

        let entry = BlockIndexEntry {
            hash,
            prev: header.prev_block,
            height,
            chainwork,
            status,
            location: None,
            bits: header.bits,
            time: header.time,
            sequence: self.next_sequence,
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, hash, entry.encode());
        batch.put(
            Column::Meta,
            META_INDEX_SEQUENCE,
            (self.next_sequence + 1).to_le_bytes(),
        );
        store.write_batch(&batch)?;

        self.next_sequence += 1;
        if status.is_failed() {
            zcore_log::log_debug!(
                "header {} descends from a failed block",
                hash256_to_hex(&hash)
            );
        }
        Ok(self.insert(entry, parent))
    }

    /// Advances the status of `id`, persisting it first. A move to `Failed` fails the whole
    /// subtree. Returns `false` when the move would go backward, which is logged and ignored.
    pub fn set_status<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        id: BlockId,
        status: BlockStatus,
    ) -> Result<bool, IndexError> {
        if status.is_failed() {
            return Ok(self.mark_failed(store, id)? > 0);
        }
        let mut batch = WriteBatch::new();
        let Some(staged) = self.stage_status(id, status, None, &mut batch)? else {
            return Ok(false);
        };
        store.write_batch(&batch)?;
        self.commit_status(staged);
        Ok(true)
    }

    /// Records where the payload of `id` lives and advances it to `DataAvailable`.
    pub fn set_data_location<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        id: BlockId,
        location: FileLocation,
    ) -> Result<(), IndexError> {
        let entry = self.entry(id).ok_or(IndexError::UnknownBlock(id))?;
        let status = entry.status.max(BlockStatus::DataAvailable);
        let mut updated = entry.clone();
        updated.location = Some(location);
        updated.status = status;
        store.put(Column::BlockIndex, &updated.hash, &updated.encode())?;
        self.commit_status(StagedStatus {
            id,
            status,
            location: Some(location),
        });
        Ok(())
    }

    /// Writes a forward status change into `batch`. Returns `None`, after logging, when the
    /// change is not a forward move. `Failed` must go through [`ChainIndex::mark_failed`].
    pub fn stage_status(
        &self,
        id: BlockId,
        status: BlockStatus,
        location: Option<FileLocation>,
        batch: &mut WriteBatch,
    ) -> Result<Option<StagedStatus>, IndexError> {
        let entry = self.entry(id).ok_or(IndexError::UnknownBlock(id))?;
        if status.is_failed() || !entry.status.can_advance_to(status) {
            zcore_log::log_warn!(
                "ignoring status change of block {} from {:?} to {:?}",
                hash256_to_hex(&entry.hash),
                entry.status,
                status
            );
            return Ok(None);
        }
        let mut updated = entry.clone();
        updated.status = status;
        if location.is_some() {
            updated.location = location;
        }
        batch.put(Column::BlockIndex, updated.hash, updated.encode());
        Ok(Some(StagedStatus {
            id,
            status,
            location: updated.location,
        }))
    }

    /// Applies a staged change after its batch has been written.
    pub fn commit_status(&mut self, staged: StagedStatus) {
        let entry = &mut self.entries[staged.id.0];
        let key = (entry.chainwork, Reverse(entry.sequence), staged.id);
        entry.status = staged.status;
        entry.location = staged.location;
        if staged.status == BlockStatus::ScriptValid {
            self.candidates.insert(key);
        } else {
            self.candidates.remove(&key);
        }
    }

    /// Marks `id` and every descendant failed. Returns how many entries changed.
    pub fn mark_failed<S: KeyValueStore + ?Sized>(
        &mut self,
        store: &S,
        id: BlockId,
    ) -> Result<usize, IndexError> {
        if self.entry(id).is_none() {
            return Err(IndexError::UnknownBlock(id));
        }
        let mut subtree = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !self.entries[next.0].status.is_failed() {
                subtree.push(next);
            }
            stack.extend(self.children(next).iter().copied());
        }
        if subtree.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for member in &subtree {
            let mut updated = self.entries[member.0].clone();
            updated.status = BlockStatus::Failed;
            batch.put(Column::BlockIndex, updated.hash, updated.encode());
        }
        store.write_batch(&batch)?;

        for member in &subtree {
            let location = self.entries[member.0].location;
            self.commit_status(StagedStatus {
                id: *member,
                status: BlockStatus::Failed,
                location,
            });
        }
        zcore_log::log_warn!(
            "marked block {} failed ({} entries)",
            hash256_to_hex(&self.entries[id.0].hash),
            subtree.len()
        );
        Ok(subtree.len())
    }

    fn insert(&mut self, entry: BlockIndexEntry, parent: Option<BlockId>) -> BlockId {
        let id = BlockId(self.entries.len());
        if parent.is_none() && self.genesis.is_none() {
            self.genesis = Some(id);
        }
        if let Some(parent) = parent {
            self.children[parent.0].push(id);
        }
        if entry.status == BlockStatus::ScriptValid {
            self.candidates
                .insert((entry.chainwork, Reverse(entry.sequence), id));
        }
        self.by_hash.insert(entry.hash, id);
        self.entries.push(entry);
        self.parents.push(parent);
        self.children.push(SmallVec::new());
        id
    }
}
