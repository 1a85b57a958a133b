//! Layered views of the unspent output set.
//!
//! [`UtxoSet`] is the durable base view. [`UtxoOverlay`] records creations and spends on top of
//! any parent view and either merges them into the parent with [`UtxoOverlay::flush`] or is
//! dropped to discard them. Overlays nest to any depth; flushing a chain of overlays one level
//! at a time leaves the base in the same state as applying every operation to it directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use zcore_consensus::Hash256;
use zcore_primitives::encoding::{DecodeError, Decoder, Encoder};
use zcore_primitives::outpoint::OutPoint;
use zcore_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;
pub const META_UTXO_BEST_BLOCK: &[u8] = b"utxo_best_block";
pub const DEFAULT_READ_CACHE_CAPACITY: usize = 100_000;

/// An unspent transparent output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.script_pubkey.len() + 14);
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = match decoder.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(DecodeError::InvalidData("invalid coinbase flag")),
        };
        decoder.finish()?;
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug)]
pub enum UtxoError {
    /// No unspent record exists for the outpoint in the composed view.
    NotFound(OutPoint),
    /// An unspent record already exists for the outpoint.
    Conflict(OutPoint),
    Store(StoreError),
}

impl std::fmt::Display for UtxoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtxoError::NotFound(outpoint) => write!(f, "no unspent output {outpoint}"),
            UtxoError::Conflict(outpoint) => write!(f, "output {outpoint} already unspent"),
            UtxoError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for UtxoError {}

impl From<StoreError> for UtxoError {
    fn from(err: StoreError) -> Self {
        UtxoError::Store(err)
    }
}

/// Read access to an unspent output set.
pub trait CoinsView {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.coin(outpoint)?.is_some())
    }

    /// The block whose connection produced this view's state.
    fn best_block(&self) -> Hash256;
}

/// A view that can absorb the changes recorded by a child overlay.
pub trait CoinsViewMut: CoinsView {
    /// Applies every change in `delta` or none of them.
    fn apply(&mut self, delta: UtxoDelta) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeltaEntry {
    /// `None` marks the outpoint spent.
    pub coin: Option<UtxoEntry>,
    /// The parent view has no unspent record for this outpoint.
    pub fresh: bool,
}

/// Changes recorded by an overlay, relative to its parent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UtxoDelta {
    pub entries: HashMap<OutPoint, DeltaEntry>,
    pub best_block: Hash256,
}

impl UtxoDelta {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the delta and its best block into `batch`.
    pub fn stage(&self, batch: &mut WriteBatch) {
        for (outpoint, entry) in &self.entries {
            let key = OutPointKey::new(outpoint);
            match &entry.coin {
                Some(coin) => batch.put(Column::Utxo, key.as_bytes(), coin.encode()),
                None if entry.fresh => {}
                None => batch.delete(Column::Utxo, key.as_bytes()),
            }
        }
        batch.put(Column::Meta, META_UTXO_BEST_BLOCK, self.best_block);
    }
}

/// An overlay of uncommitted creations and spends on top of `parent`.
pub struct UtxoOverlay<'a, P: CoinsView + ?Sized> {
    parent: &'a mut P,
    entries: HashMap<OutPoint, DeltaEntry>,
    best_block: Hash256,
}

impl<'a, P: CoinsView + ?Sized> UtxoOverlay<'a, P> {
    pub fn new(parent: &'a mut P) -> Self {
        let best_block = parent.best_block();
        Self {
            parent,
            entries: HashMap::new(),
            best_block,
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.parent.coin(outpoint),
        }
    }

    /// Marks the output spent and returns the record that was consumed.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<UtxoEntry, UtxoError> {
        if let Some(entry) = self.entries.get_mut(outpoint) {
            let coin = entry
                .coin
                .take()
                .ok_or_else(|| UtxoError::NotFound(outpoint.clone()))?;
            if entry.fresh {
                self.entries.remove(outpoint);
            }
            return Ok(coin);
        }
        let coin = self
            .parent
            .coin(outpoint)?
            .ok_or_else(|| UtxoError::NotFound(outpoint.clone()))?;
        self.entries.insert(
            outpoint.clone(),
            DeltaEntry {
                coin: None,
                fresh: false,
            },
        );
        Ok(coin)
    }

    pub fn create(&mut self, outpoint: OutPoint, coin: UtxoEntry) -> Result<(), UtxoError> {
        if let Some(entry) = self.entries.get_mut(&outpoint) {
            if entry.coin.is_some() {
                return Err(UtxoError::Conflict(outpoint));
            }
            entry.coin = Some(coin);
            return Ok(());
        }
        if self.parent.have_coin(&outpoint)? {
            return Err(UtxoError::Conflict(outpoint));
        }
        self.entries.insert(
            outpoint,
            DeltaEntry {
                coin: Some(coin),
                fresh: true,
            },
        );
        Ok(())
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }

    pub fn delta_len(&self) -> usize {
        self.entries.len()
    }

    /// Detaches the recorded changes without touching the parent.
    pub fn into_delta(self) -> UtxoDelta {
        UtxoDelta {
            entries: self.entries,
            best_block: self.best_block,
        }
    }
}

impl<P: CoinsViewMut + ?Sized> UtxoOverlay<'_, P> {
    /// Merges the recorded changes into the parent. On error the parent is unchanged.
    pub fn flush(self) -> Result<(), StoreError> {
        let delta = UtxoDelta {
            entries: self.entries,
            best_block: self.best_block,
        };
        self.parent.apply(delta)
    }
}

impl<P: CoinsView + ?Sized> CoinsView for UtxoOverlay<'_, P> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        self.get(outpoint)
    }

    fn best_block(&self) -> Hash256 {
        self.best_block
    }
}

impl<P: CoinsView + ?Sized> CoinsViewMut for UtxoOverlay<'_, P> {
    fn apply(&mut self, delta: UtxoDelta) -> Result<(), StoreError> {
        for (outpoint, child) in delta.entries {
            match self.entries.get_mut(&outpoint) {
                Some(local) if child.coin.is_none() && local.fresh => {
                    self.entries.remove(&outpoint);
                }
                Some(local) => local.coin = child.coin,
                None if child.coin.is_none() && child.fresh => {}
                None => {
                    self.entries.insert(outpoint, child);
                }
            }
        }
        self.best_block = delta.best_block;
        Ok(())
    }
}

/// The durable unspent output set with a bounded cache of decoded records.
pub struct UtxoSet<S> {
    store: S,
    best_block: Hash256,
    cache: Mutex<ReadCache>,
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn open(store: S) -> Result<Self, StoreError> {
        Self::open_with_cache_capacity(store, DEFAULT_READ_CACHE_CAPACITY)
    }

    pub fn open_with_cache_capacity(store: S, capacity: usize) -> Result<Self, StoreError> {
        let best_block = match store.get(Column::Meta, META_UTXO_BEST_BLOCK)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt("utxo best block"))?,
            None => [0u8; 32],
        };
        Ok(Self {
            store,
            best_block,
            cache: Mutex::new(ReadCache::new(capacity)),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Updates in-memory state after `delta` has been written by the caller.
    pub fn mark_committed(&mut self, delta: &UtxoDelta) {
        let mut cache = self.cache.lock().expect("utxo cache lock");
        for outpoint in delta.entries.keys() {
            cache.remove(&OutPointKey::new(outpoint));
        }
        self.best_block = delta.best_block;
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        let cache = self.cache.lock().expect("utxo cache lock");
        (cache.hits, cache.misses)
    }
}

impl<S: KeyValueStore> CoinsView for UtxoSet<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let key = OutPointKey::new(outpoint);
        if let Some(entry) = self.cache.lock().expect("utxo cache lock").get(&key) {
            return Ok(Some(entry));
        }
        let Some(bytes) = self.store.get(Column::Utxo, key.as_bytes())? else {
            return Ok(None);
        };
        let entry = UtxoEntry::decode(&bytes).map_err(|_| StoreError::Corrupt("utxo entry"))?;
        self.cache
            .lock()
            .expect("utxo cache lock")
            .insert(key, entry.clone());
        Ok(Some(entry))
    }

    fn best_block(&self) -> Hash256 {
        self.best_block
    }
}

impl<S: KeyValueStore> CoinsViewMut for UtxoSet<S> {
    fn apply(&mut self, delta: UtxoDelta) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        delta.stage(&mut batch);
        self.store.write_batch(&batch)?;
        self.mark_committed(&delta);
        Ok(())
    }
}

struct CachedEntry {
    entry: UtxoEntry,
    stamp: u64,
}

/// Least-recently-used cache; stale order slots are skipped on eviction.
struct ReadCache {
    entries: HashMap<OutPointKey, CachedEntry>,
    order: VecDeque<(OutPointKey, u64)>,
    capacity: usize,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl ReadCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            clock: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: &OutPointKey) -> Option<UtxoEntry> {
        self.clock = self.clock.wrapping_add(1);
        let stamp = self.clock;
        let Some(cached) = self.entries.get_mut(key) else {
            self.misses += 1;
            return None;
        };
        self.hits += 1;
        cached.stamp = stamp;
        self.order.push_back((*key, stamp));
        Some(cached.entry.clone())
    }

    fn insert(&mut self, key: OutPointKey, entry: UtxoEntry) {
        if self.capacity == 0 {
            return;
        }
        self.clock = self.clock.wrapping_add(1);
        let stamp = self.clock;
        self.entries.insert(key, CachedEntry { entry, stamp });
        self.order.push_back((key, stamp));
        while self.entries.len() > self.capacity {
            let Some((key, stamp)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&key).is_some_and(|cached| cached.stamp == stamp) {
                self.entries.remove(&key);
            }
        }
        if self.order.len() > self.capacity.saturating_mul(4) {
            let entries = &self.entries;
            self.order
                .retain(|(key, stamp)| entries.get(key).is_some_and(|c| c.stamp == *stamp));
        }
    }

    fn remove(&mut self, key: &OutPointKey) {
        self.entries.remove(key);
    }
}
