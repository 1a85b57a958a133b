//! Consensus-wide constants shared across validation.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 4;
/// The minimum allowed transaction version (network rule).
pub const SPROUT_MIN_TX_VERSION: i32 = 1;
/// The minimum allowed Overwinter transaction version (network rule).
pub const OVERWINTER_MIN_TX_VERSION: i32 = 3;
/// The maximum allowed Overwinter transaction version (network rule).
pub const OVERWINTER_MAX_TX_VERSION: i32 = 3;
/// The minimum allowed Sapling transaction version (network rule).
pub const SAPLING_MIN_TX_VERSION: i32 = 4;
/// The maximum allowed Sapling transaction version (network rule).
pub const SAPLING_MAX_TX_VERSION: i32 = 4;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 2_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;
/// The maximum size of a transaction before Sapling (network rule).
pub const MAX_TX_SIZE_BEFORE_SAPLING: u32 = 100_000;
/// The maximum size of a transaction after Sapling (network rule).
pub const MAX_TX_SIZE_AFTER_SAPLING: u32 = MAX_BLOCK_SIZE;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// The minimum value which is invalid for expiry height.
pub const TX_EXPIRY_HEIGHT_THRESHOLD: u32 = 500_000_000;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Maximum number of signature operations in a standard transaction (policy).
pub const MAX_STANDARD_TX_SIGOPS: u32 = MAX_BLOCK_SIGOPS / 5;
/// Maximum serialized size of a standard transaction (policy).
pub const MAX_STANDARD_TX_SIZE: u32 = 100_000;
/// Priority threshold above which a transaction may be relayed for free (policy).
pub const ALLOW_FREE_THRESHOLD: f64 = 100_000_000.0 * 144.0 / 250.0;
