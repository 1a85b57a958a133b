//! Consensus parameter definitions.

use crate::constants::COINBASE_MATURITY;
use crate::upgrades::{Hash256, NetworkUpgrade, UpgradeIndex, MAX_NETWORK_UPGRADES};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub coinbase_maturity: i32,
    pub upgrades: [NetworkUpgrade; MAX_NETWORK_UPGRADES],
    pub pow_limit: Hash256,
}

impl ConsensusParams {
    /// Overrides an upgrade activation height, as `-nuparams` does on regtest.
    pub fn set_activation_height(&mut self, idx: UpgradeIndex, height: i32) {
        self.upgrades[idx.as_usize()].activation_height = height;
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Display-order (byte-reversed) hex of an internal hash.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }

    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();

    Ok(bytes)
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

fn upgrade(protocol_version: i32, activation_height: i32) -> NetworkUpgrade {
    NetworkUpgrade {
        protocol_version,
        activation_height,
    }
}

fn hash_const(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(_) => [0u8; 32],
    }
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash_const(
            "00040fe8ec8471911baa1db1266ea15dd06b4a8a5c453883c000b031973dce08",
        ),
        coinbase_maturity: COINBASE_MATURITY,
        upgrades: [
            upgrade(170_002, NetworkUpgrade::ALWAYS_ACTIVE),
            upgrade(170_002, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
            upgrade(170_005, 347_500),
            upgrade(170_007, 419_200),
            upgrade(170_009, 653_600),
            upgrade(170_011, 903_000),
            upgrade(170_013, 1_046_400),
        ],
        pow_limit: hash_const("0007ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash_const(
            "05a60a92d99d85997cce3b87616c089f6124d7342af37106edc76126334a2c38",
        ),
        coinbase_maturity: COINBASE_MATURITY,
        upgrades: [
            upgrade(170_002, NetworkUpgrade::ALWAYS_ACTIVE),
            upgrade(170_002, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
            upgrade(170_003, 207_500),
            upgrade(170_007, 280_000),
            upgrade(170_008, 584_000),
            upgrade(170_010, 903_800),
            upgrade(170_012, 1_028_500),
        ],
        pow_limit: hash_const("07ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hash_const(
            "029f11d80ef9765602235e1bc9727e3eb6ba20839319f761fee920d63401e327",
        ),
        coinbase_maturity: COINBASE_MATURITY,
        upgrades: [
            upgrade(170_002, NetworkUpgrade::ALWAYS_ACTIVE),
            upgrade(170_002, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
            upgrade(170_003, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
            upgrade(170_006, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
            upgrade(170_008, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
            upgrade(170_010, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
            upgrade(170_012, NetworkUpgrade::NO_ACTIVATION_HEIGHT),
        ],
        pow_limit: hash_const("0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_hash_is_reversed_into_internal_order() {
        let hash = hash256_from_hex("0x01").expect("hash");
        assert_eq!(hash[0], 0x01);
        assert!(hash[1..].iter().all(|byte| *byte == 0));
        assert!(hash256_from_hex("zz").is_err());
        assert!(hash256_from_hex("").is_err());
    }

    #[test]
    fn network_names_parse() {
        assert_eq!(Network::parse("main"), Some(Network::Mainnet));
        assert_eq!(Network::parse("REGTEST"), Some(Network::Regtest));
        assert_eq!(Network::parse("devnet"), None);
        assert_eq!(Network::Testnet.as_str(), "testnet");
    }

    #[test]
    fn genesis_hashes_decode() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(params.hash_genesis_block[31], 0x00);
        assert_eq!(params.hash_genesis_block[0], 0x08);
    }
}
