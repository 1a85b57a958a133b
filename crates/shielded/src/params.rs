use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use zcore_consensus::Network;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ParamsKind {
    SaplingSpend,
    SaplingOutput,
    SproutGroth16,
}

impl ParamsKind {
    pub const ALL: [ParamsKind; 3] = [
        ParamsKind::SaplingSpend,
        ParamsKind::SaplingOutput,
        ParamsKind::SproutGroth16,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamsKind::SaplingSpend => "sapling-spend",
            ParamsKind::SaplingOutput => "sapling-output",
            ParamsKind::SproutGroth16 => "sprout-groth16",
        }
    }

    /// Test networks use the `-testnet` parameter files.
    pub fn file_name(self, network: Network) -> String {
        match network {
            Network::Mainnet => format!("{}.params", self.as_str()),
            Network::Testnet | Network::Regtest => format!("{}-testnet.params", self.as_str()),
        }
    }
}

/// BLAKE2b-512 digest of a parameter file.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ParamsId(pub [u8; 64]);

impl ParamsId {
    pub fn from_hex(hex: &str) -> Result<Self, ParamsError> {
        let invalid = || ParamsError::InvalidId(hex.to_string());
        if hex.len() != 128 {
            return Err(invalid());
        }
        let mut out = [0u8; 64];
        for (slot, pair) in out.iter_mut().zip(hex.as_bytes().chunks(2)) {
            let high = (pair[0] as char).to_digit(16).ok_or_else(invalid)?;
            let low = (pair[1] as char).to_digit(16).ok_or_else(invalid)?;
            *slot = (high << 4 | low) as u8;
        }
        Ok(Self(out))
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        let mut out = [0u8; 64];
        out.copy_from_slice(blake2b_simd::blake2b(data).as_bytes());
        Self(out)
    }
}

impl fmt::Display for ParamsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ParamsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParamsId({self})")
    }
}

/// One identifier per parameter kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParamsSet {
    pub sapling_spend: ParamsId,
    pub sapling_output: ParamsId,
    pub sprout_groth16: ParamsId,
}

const MAINNET_SAPLING_SPEND: &str = "8270785a1a0d0bc77196f000ee6d221c9c9894f55307bd9357c3f0105d31ca63991ab91324160d8f53e2bbd3c2633a6eb8bdf5205d822e7f3f73edac51b2b70c";
const MAINNET_SAPLING_OUTPUT: &str = "657e3d38dbb5cb5e7dd2970e8b03d69b4787dd907285b5a7f0790dcc8072f60bf593b32cc2d1c030e00ff5ae64bf84c5c3beb84ddc841d48264b4a171744d028";
const MAINNET_SPROUT_GROTH16: &str = "e9b238411bd6c0ec4791e9d04245ec350c9c5744f5610dfcce4365d5ca49dfefd5054e371842b3f88fa1b9d7e8e075249b3ebabd167fa8b0f3161292d36c180a";

const TESTNET_SAPLING_SPEND: &str = "35f6afd7d7514531aaa9fa529bdcddf116865f02abdd42164322bb1949227d82bdae295cad9c7b98d4bbbb00e045fa17aca79c90f53433a66bce4e82b6a1936d";
const TESTNET_SAPLING_OUTPUT: &str = "f9d0b98ea51830c4974878f1b32bb68b2bf530e2e0ae09cd2a9b609d6fda37f1a1928e2d1ca91c31835c75dcc16057db53a807cc5cb37ebcfb753aa843a8ac21";
const TESTNET_SPROUT_GROTH16: &str = "7a6723311162cb0c664c742d2fa42278195ade98ba3f21ef4fa02b82c83aed696e107e389ac7b3b0f33f417aeefe5be775d117910a473a422b4a1b97489fbdd6";

impl ParamsSet {
    /// Published digests of the parameter files for `network`.
    pub fn for_network(network: Network) -> Result<Self, ParamsError> {
        let (spend, output, sprout) = match network {
            Network::Mainnet => (
                MAINNET_SAPLING_SPEND,
                MAINNET_SAPLING_OUTPUT,
                MAINNET_SPROUT_GROTH16,
            ),
            Network::Testnet | Network::Regtest => (
                TESTNET_SAPLING_SPEND,
                TESTNET_SAPLING_OUTPUT,
                TESTNET_SPROUT_GROTH16,
            ),
        };
        Ok(Self {
            sapling_spend: ParamsId::from_hex(spend)?,
            sapling_output: ParamsId::from_hex(output)?,
            sprout_groth16: ParamsId::from_hex(sprout)?,
        })
    }

    pub fn get(&self, kind: ParamsKind) -> &ParamsId {
        match kind {
            ParamsKind::SaplingSpend => &self.sapling_spend,
            ParamsKind::SaplingOutput => &self.sapling_output,
            ParamsKind::SproutGroth16 => &self.sprout_groth16,
        }
    }

    pub fn set(&mut self, kind: ParamsKind, id: ParamsId) {
        match kind {
            ParamsKind::SaplingSpend => self.sapling_spend = id,
            ParamsKind::SaplingOutput => self.sapling_output = id,
            ParamsKind::SproutGroth16 => self.sprout_groth16 = id,
        }
    }
}

#[derive(Debug)]
pub enum ParamsError {
    Io(PathBuf, io::Error),
    Missing(ParamsKind, PathBuf),
    HashMismatch {
        kind: ParamsKind,
        path: PathBuf,
        expected: ParamsId,
        actual: ParamsId,
    },
    InvalidId(String),
}

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamsError::Io(path, err) => write!(f, "{}: {err}", path.display()),
            ParamsError::Missing(kind, path) => write!(
                f,
                "missing {} parameters: expected {}",
                kind.as_str(),
                path.display()
            ),
            ParamsError::HashMismatch {
                kind,
                path,
                expected,
                actual,
            } => write!(
                f,
                "{} parameters at {} have BLAKE2b-512 {actual}, expected {expected}",
                kind.as_str(),
                path.display()
            ),
            ParamsError::InvalidId(raw) => write!(f, "invalid parameter id {raw:?}"),
        }
    }
}

impl std::error::Error for ParamsError {}

/// Parameter files that passed their digest check.
#[derive(Clone, Debug)]
pub struct LoadedParams {
    pub ids: ParamsSet,
    pub paths: Vec<(ParamsKind, PathBuf)>,
    pub total_bytes: u64,
}

pub fn default_params_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join("Library/Application Support/ZcashParams");
        }
    }
    if cfg!(windows) {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("ZcashParams");
        }
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".zcash-params"),
        None => PathBuf::from(".zcash-params"),
    }
}

/// Reads every parameter file for `network` once and checks its digest against `expected`.
pub fn load_params(
    dir: &Path,
    network: Network,
    expected: &ParamsSet,
) -> Result<LoadedParams, ParamsError> {
    let mut paths = Vec::with_capacity(ParamsKind::ALL.len());
    let mut total_bytes = 0u64;
    for kind in ParamsKind::ALL {
        let path = dir.join(kind.file_name(network));
        if !path.is_file() {
            return Err(ParamsError::Missing(kind, path));
        }
        let (actual, len) = hash_file(&path).map_err(|err| ParamsError::Io(path.clone(), err))?;
        let expected = *expected.get(kind);
        if actual != expected {
            return Err(ParamsError::HashMismatch {
                kind,
                path,
                expected,
                actual,
            });
        }
        zcore_log::log_debug!("{} parameters verified ({} bytes)", kind.as_str(), len);
        total_bytes += len;
        paths.push((kind, path));
    }
    zcore_log::log_debug!(
        "shielded parameters in {} total {} bytes",
        dir.display(),
        total_bytes
    );
    Ok(LoadedParams {
        ids: *expected,
        paths,
        total_bytes,
    })
}

fn hash_file(path: &Path) -> io::Result<(ParamsId, u64)> {
    let mut file = File::open(path)?;
    let mut state = blake2b_simd::State::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut len = 0u64;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        state.update(&buf[..read]);
        len += read as u64;
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(state.finalize().as_bytes());
    Ok((ParamsId(out), len))
}
