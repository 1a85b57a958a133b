//! Bulk import of blocks from files of concatenated consensus-encoded blocks.

use std::fs;
use std::path::{Path, PathBuf};

use zcore_consensus::hash256_to_hex;
use zcore_primitives::block::{Block, BlockDecodeError};
use zcore_primitives::encoding::Decoder;
use zcore_storage::KeyValueStore;

use crate::context::{ContextError, ValidationContext};

#[derive(Debug)]
pub enum ImportError {
    Read(PathBuf, std::io::Error),
    Decode {
        path: PathBuf,
        offset: usize,
        error: BlockDecodeError,
    },
    Context(ContextError),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Read(path, err) => write!(f, "failed to read {}: {err}", path.display()),
            ImportError::Decode {
                path,
                offset,
                error,
            } => write!(f, "{} at byte {offset}: {error}", path.display()),
            ImportError::Context(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ImportError {}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportSummary {
    pub connected: usize,
    pub skipped: usize,
    pub rejected: usize,
}

/// Connects every block in `path` that extends the tip. Invalid blocks are logged and skipped;
/// a trailing partial block or a fatal error stops the import.
pub fn import_blocks<S: KeyValueStore>(
    ctx: &ValidationContext<S>,
    path: &Path,
) -> Result<ImportSummary, ImportError> {
    let bytes = fs::read(path).map_err(|err| ImportError::Read(path.to_path_buf(), err))?;
    let total = bytes.len();
    let mut decoder = Decoder::new(&bytes);
    let mut summary = ImportSummary::default();

    while !decoder.is_empty() {
        let offset = total - decoder.remaining();
        let block = Block::decode_from(&mut decoder).map_err(|error| ImportError::Decode {
            path: path.to_path_buf(),
            offset,
            error,
        })?;
        let hash = block.hash();
        let tip = ctx.tip().map_or([0u8; 32], |entry| entry.hash);
        if block.header.prev_block != tip {
            summary.skipped += 1;
            continue;
        }
        match ctx.connect_block(&block) {
            Ok(_) => summary.connected += 1,
            // Observer failures do not undo the connect.
            Err(err @ ContextError::Notification { .. }) => {
                zcore_log::log_warn!("import: {err}");
                summary.connected += 1;
            }
            Err(err) if err.is_consensus() => {
                zcore_log::log_warn!(
                    "import: rejected block {}: {err}",
                    hash256_to_hex(&hash)
                );
                summary.rejected += 1;
            }
            Err(err) => return Err(ImportError::Context(err)),
        }
    }

    zcore_log::log_info!(
        "Imported {}: {} connected, {} skipped, {} rejected",
        path.display(),
        summary.connected,
        summary.skipped,
        summary.rejected
    );
    Ok(summary)
}
