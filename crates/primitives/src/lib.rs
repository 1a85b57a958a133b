//! Block and transaction types with their consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{merkle_root, Block, BlockDecodeError, BlockHeader};
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{
    JoinSplit, OutputDescription, SpendDescription, SproutProof, Transaction, TxIn, TxOut,
};
