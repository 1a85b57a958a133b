//! Chain state: the UTXO set, block index, block files and block validation.

pub mod blockindex;
pub mod checkqueue;
pub mod flatfiles;
pub mod index;
pub mod state;
pub mod undo;
pub mod utxo;
pub mod validation;

pub use checkqueue::{CheckQueue, CheckQueueError, ScriptJob, ScriptVerifier, TemplateVerifier};
pub use state::{ChainState, ChainStateError, ConnectedBlock, DisconnectedBlock};
pub use utxo::{CoinsView, CoinsViewMut, UtxoDelta, UtxoEntry, UtxoError, UtxoOverlay, UtxoSet};
pub use validation::{ConsensusViolation, ValidationError, ValidationFlags};
