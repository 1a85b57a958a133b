//! The candidate transaction pool: admission descriptors, ordering and eviction.

pub mod entry;
pub mod policy;
pub mod pool;

use zcore_consensus::{hash256_to_hex, Hash256};
use zcore_primitives::outpoint::OutPoint;
use zcore_storage::StoreError;

pub use entry::{make_entry, MempoolEntry};
pub use policy::MempoolPolicy;
pub use pool::{InsertOutcome, Mempool, PoolCoins};

/// Height recorded for outputs that exist only in the pool.
pub const MEMPOOL_HEIGHT: u32 = 0x7fff_ffff;

#[derive(Debug)]
pub enum MempoolError {
    AlreadyInMempool(Hash256),
    ConflictingInput {
        outpoint: OutPoint,
        spender: Hash256,
    },
    ConflictingNullifier {
        nullifier: Hash256,
        spender: Hash256,
    },
    MissingInputs(Vec<OutPoint>),
    /// The pool is at its byte limit and the transaction pays too little to displace anything.
    MempoolFull,
    Coinbase,
    NonStandard(&'static str),
    InsufficientFee {
        fee: i64,
        required: i64,
    },
    ValueOutOfRange(Hash256),
    InputsBelowOutputs(Hash256),
    Store(StoreError),
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::AlreadyInMempool(txid) => {
                write!(f, "transaction {} already in mempool", hash256_to_hex(txid))
            }
            MempoolError::ConflictingInput { outpoint, spender } => write!(
                f,
                "input {outpoint} already spent by {}",
                hash256_to_hex(spender)
            ),
            MempoolError::ConflictingNullifier { nullifier, spender } => write!(
                f,
                "nullifier {} already spent by {}",
                hash256_to_hex(nullifier),
                hash256_to_hex(spender)
            ),
            MempoolError::MissingInputs(missing) => {
                write!(f, "missing inputs:")?;
                for outpoint in missing {
                    write!(f, " {outpoint}")?;
                }
                Ok(())
            }
            MempoolError::MempoolFull => write!(f, "mempool full"),
            MempoolError::Coinbase => write!(f, "coinbase transactions are not relayed"),
            MempoolError::NonStandard(reason) => write!(f, "non-standard transaction: {reason}"),
            MempoolError::InsufficientFee { fee, required } => {
                write!(f, "insufficient fee: {fee} < {required}")
            }
            MempoolError::ValueOutOfRange(txid) => {
                write!(f, "transaction {} value out of range", hash256_to_hex(txid))
            }
            MempoolError::InputsBelowOutputs(txid) => write!(
                f,
                "transaction {} spends more than its inputs",
                hash256_to_hex(txid)
            ),
            MempoolError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MempoolError {}

impl From<StoreError> for MempoolError {
    fn from(err: StoreError) -> Self {
        MempoolError::Store(err)
    }
}
