//! Command-line and config-file settings for `zcored`.
//!
//! Every option can also appear in the config file as `name=value` (flags as `name=1`).
//! Command-line values override the file; repeatable options accumulate.

use std::fs;
use std::path::{Path, PathBuf};

use zcore_consensus::upgrades::{UpgradeIndex, ALL_UPGRADES, NETWORK_UPGRADE_INFO};
use zcore_consensus::{consensus_params, ConsensusParams, Network};
use zcore_log::{Format, Level};
use zcore_shielded::default_params_dir;

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "zcore.conf";
pub const DEFAULT_MAX_MEMPOOL_MB: usize = 300;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub conf_path: Option<PathBuf>,
    pub network: Network,
    pub backend: Backend,
    /// Script check threads including the thread that issues the batch.
    pub par: usize,
    pub max_mempool_bytes: usize,
    pub params_dir: PathBuf,
    pub load_params: bool,
    pub load_blocks: Vec<PathBuf>,
    pub nuparams: Vec<(UpgradeIndex, i32)>,
    pub log_level: Level,
    pub log_format: Format,
    pub log_timestamps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            conf_path: None,
            network: Network::Mainnet,
            backend: Backend::Fjall,
            par: default_par(),
            max_mempool_bytes: DEFAULT_MAX_MEMPOOL_MB * 1024 * 1024,
            params_dir: default_params_dir(),
            load_params: true,
            load_blocks: Vec::new(),
            nuparams: Vec::new(),
            log_level: Level::Info,
            log_format: Format::Text,
            log_timestamps: true,
        }
    }
}

impl Config {
    /// Network parameters with any `--nuparams` overrides applied.
    pub fn consensus_params(&self) -> ConsensusParams {
        let mut params = consensus_params(self.network);
        for (upgrade, height) in &self.nuparams {
            params.set_activation_height(*upgrade, *height);
        }
        params
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }
}

pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingValue(String),
    InvalidValue { option: String, value: String },
    UnknownOption(String),
    NuparamsOutsideRegtest,
    ConfRead { path: PathBuf, error: std::io::Error },
    ConfLine { path: PathBuf, line: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingValue(option) => write!(f, "missing value for --{option}"),
            ConfigError::InvalidValue { option, value } => {
                write!(f, "invalid value '{value}' for --{option}")
            }
            ConfigError::UnknownOption(option) => write!(f, "unknown option '{option}'"),
            ConfigError::NuparamsOutsideRegtest => {
                write!(f, "--nuparams is only allowed with --network regtest")
            }
            ConfigError::ConfRead { path, error } => {
                write!(f, "failed to read config file {}: {error}", path.display())
            }
            ConfigError::ConfLine { path, line } => {
                write!(f, "malformed line {line} in config file {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn parse_args() -> Result<CliAction, ConfigError> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut settings: Vec<(String, Option<String>)> = Vec::new();
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" | "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
        let Some(option) = arg.strip_prefix("--") else {
            return Err(ConfigError::UnknownOption(arg));
        };
        if let Some((name, value)) = option.split_once('=') {
            settings.push((name.to_string(), Some(value.to_string())));
        } else if is_flag(option) {
            settings.push((option.to_string(), None));
        } else if takes_value(option) {
            let value = args
                .next()
                .ok_or_else(|| ConfigError::MissingValue(option.to_string()))?;
            settings.push((option.to_string(), Some(value)));
        } else {
            return Err(ConfigError::UnknownOption(arg));
        }
    }

    let mut config = Config::default();
    for (name, value) in &settings {
        match name.as_str() {
            "datadir" => config.data_dir = PathBuf::from(require(name, value)?),
            "conf" => config.conf_path = Some(PathBuf::from(require(name, value)?)),
            _ => {}
        }
    }

    let conf_path = config
        .conf_path
        .clone()
        .unwrap_or_else(|| config.data_dir.join(CONF_FILE_NAME));
    if config.conf_path.is_some() || conf_path.is_file() {
        for (name, value) in read_conf(&conf_path)? {
            if name == "datadir" || name == "conf" {
                continue;
            }
            apply(&mut config, &name, value.as_deref())?;
        }
        config.conf_path = Some(conf_path);
    }
    // Command-line values are applied last.
    for (name, value) in &settings {
        apply(&mut config, name, value.as_deref())?;
    }

    if !config.nuparams.is_empty() && config.network != Network::Regtest {
        return Err(ConfigError::NuparamsOutsideRegtest);
    }
    Ok(CliAction::Run(config))
}

fn is_flag(name: &str) -> bool {
    matches!(name, "no-params" | "log-timestamps" | "no-log-timestamps")
}

fn takes_value(name: &str) -> bool {
    matches!(
        name,
        "datadir"
            | "conf"
            | "network"
            | "backend"
            | "par"
            | "maxmempool"
            | "params-dir"
            | "loadblock"
            | "nuparams"
            | "log-level"
            | "log-format"
    )
}

fn require<'a>(name: &str, value: &'a Option<String>) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .ok_or_else(|| ConfigError::MissingValue(name.to_string()))
}

fn invalid(option: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
    }
}

fn apply(config: &mut Config, name: &str, value: Option<&str>) -> Result<(), ConfigError> {
    if is_flag(name) {
        let enabled = match value {
            None => true,
            Some(raw) => parse_bool(raw).ok_or_else(|| invalid(name, raw))?,
        };
        match name {
            "no-params" => config.load_params = !enabled,
            "log-timestamps" => config.log_timestamps = enabled,
            _ => config.log_timestamps = !enabled,
        }
        return Ok(());
    }
    if !takes_value(name) {
        return Err(ConfigError::UnknownOption(format!("--{name}")));
    }
    let value = value.ok_or_else(|| ConfigError::MissingValue(name.to_string()))?;
    match name {
        "datadir" => config.data_dir = PathBuf::from(value),
        "conf" => config.conf_path = Some(PathBuf::from(value)),
        "network" => config.network = Network::parse(value).ok_or_else(|| invalid(name, value))?,
        "backend" => config.backend = Backend::parse(value).ok_or_else(|| invalid(name, value))?,
        "par" => {
            config.par = value
                .parse::<usize>()
                .ok()
                .filter(|par| *par > 0)
                .ok_or_else(|| invalid(name, value))?
        }
        "maxmempool" => {
            let mb = value.parse::<usize>().map_err(|_| invalid(name, value))?;
            config.max_mempool_bytes = mb
                .checked_mul(1024 * 1024)
                .ok_or_else(|| invalid(name, value))?;
        }
        "params-dir" => config.params_dir = PathBuf::from(value),
        "loadblock" => config.load_blocks.push(PathBuf::from(value)),
        "nuparams" => {
            let parsed = parse_nuparams(value).ok_or_else(|| invalid(name, value))?;
            config.nuparams.retain(|(upgrade, _)| *upgrade != parsed.0);
            config.nuparams.push(parsed);
        }
        "log-level" => config.log_level = Level::parse(value).ok_or_else(|| invalid(name, value))?,
        "log-format" => {
            config.log_format = Format::parse(value).ok_or_else(|| invalid(name, value))?
        }
        other => return Err(ConfigError::UnknownOption(format!("--{other}"))),
    }
    Ok(())
}

/// `NAME:HEIGHT` where NAME is an upgrade name or its hex branch id, e.g. `sapling:10` or
/// `76b809bb:10`.
fn parse_nuparams(value: &str) -> Option<(UpgradeIndex, i32)> {
    let (name, height) = value.split_once(':')?;
    let height = height.trim().parse::<i32>().ok().filter(|height| *height >= 0)?;
    let name = name.trim();
    let branch_id = u32::from_str_radix(name, 16).ok().filter(|_| name.len() == 8);
    ALL_UPGRADES
        .iter()
        .skip(1)
        .find(|upgrade| {
            let info = &NETWORK_UPGRADE_INFO[upgrade.as_usize()];
            info.name.eq_ignore_ascii_case(name) || branch_id == Some(info.branch_id)
        })
        .map(|upgrade| (*upgrade, height))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn read_conf(path: &Path) -> Result<Vec<(String, Option<String>)>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|error| ConfigError::ConfRead {
        path: path.to_path_buf(),
        error,
    })?;
    let mut out = Vec::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
            None => (line, None),
        };
        if key.is_empty() {
            return Err(ConfigError::ConfLine {
                path: path.to_path_buf(),
                line: index + 1,
            });
        }
        out.push((key.to_ascii_lowercase(), value));
    }
    Ok(out)
}

fn default_par() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

pub fn usage() -> String {
    [
        "Usage:",
        "  zcored [options]",
        "",
        "Options:",
        "  --help, -h            Print this help and exit",
        "  --version, -V         Print version and exit",
        "  --datadir DIR         Data directory (default: ./data)",
        "  --conf FILE           Config file (default: <datadir>/zcore.conf)",
        "  --network NAME        mainnet|testnet|regtest (default: mainnet)",
        "  --backend NAME        memory|fjall (default: fjall)",
        "  --par N               Script check threads, including the caller (default: CPU count)",
        "  --maxmempool MB       Mempool size limit (default: 300)",
        "  --params-dir DIR      Shielded parameter directory (default: ~/.zcash-params)",
        "  --no-params           Skip loading shielded parameters; shielded txs are rejected",
        "  --loadblock FILE      Import concatenated blocks from FILE (repeatable)",
        "  --nuparams NAME:H     Regtest only: activate upgrade NAME at height H (repeatable)",
        "  --log-level LEVEL     error|warn|info|debug|trace (default: info)",
        "  --log-format FORMAT   text|json (default: text)",
        "  --log-timestamps      Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps   Disable timestamps in text logs",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Result<Config, ConfigError> {
        match parse_args_from(args.iter().map(|arg| arg.to_string()))? {
            CliAction::Run(config) => Ok(config),
            _ => panic!("expected a run action"),
        }
    }

    #[test]
    fn parses_values_and_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let datadir = dir.path().to_string_lossy().to_string();
        let config = run(&[
            "--datadir",
            &datadir,
            "--network",
            "regtest",
            "--backend=memory",
            "--par",
            "3",
            "--maxmempool",
            "5",
            "--no-params",
            "--loadblock",
            "a.dat",
            "--loadblock",
            "b.dat",
            "--log-level",
            "debug",
            "--no-log-timestamps",
        ])
        .expect("config");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.par, 3);
        assert_eq!(config.max_mempool_bytes, 5 * 1024 * 1024);
        assert!(!config.load_params);
        assert_eq!(config.load_blocks.len(), 2);
        assert_eq!(config.log_level, Level::Debug);
        assert!(!config.log_timestamps);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(run(&["--par", "0"]), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(run(&["--network"]), Err(ConfigError::MissingValue(_))));
        assert!(matches!(run(&["--bogus"]), Err(ConfigError::UnknownOption(_))));
        assert!(matches!(
            run(&["--nuparams", "sapling:5"]),
            Err(ConfigError::NuparamsOutsideRegtest)
        ));
        assert!(matches!(
            parse_args_from(vec!["--help".to_string()]),
            Ok(CliAction::PrintHelp)
        ));
    }

    #[test]
    fn nuparams_accept_names_and_branch_ids() {
        assert_eq!(
            parse_nuparams("Sapling:10"),
            Some((UpgradeIndex::Sapling, 10))
        );
        assert_eq!(
            parse_nuparams("5ba81b19:4"),
            Some((UpgradeIndex::Overwinter, 4))
        );
        assert_eq!(parse_nuparams("sprout:1"), None);
        assert_eq!(parse_nuparams("sapling:-2"), None);

        let config = run(&[
            "--network",
            "regtest",
            "--nuparams",
            "overwinter:1",
            "--nuparams",
            "sapling:2",
        ])
        .expect("config");
        let params = config.consensus_params();
        assert_eq!(
            params.upgrades[UpgradeIndex::Sapling.as_usize()].activation_height,
            2
        );
    }

    #[test]
    fn command_line_overrides_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("node.conf");
        fs::write(
            &conf,
            "# test\nnetwork=regtest\npar=7\nno-params=1\nloadblock=one.dat\n",
        )
        .expect("write conf");
        let conf_arg = conf.to_string_lossy().to_string();
        let config = run(&["--conf", &conf_arg, "--par", "2", "--loadblock", "two.dat"])
            .expect("config");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.par, 2);
        assert!(!config.load_params);
        assert_eq!(
            config.load_blocks,
            vec![PathBuf::from("one.dat"), PathBuf::from("two.dat")]
        );

        fs::write(&conf, "=oops\n").expect("write conf");
        assert!(matches!(
            run(&["--conf", &conf_arg]),
            Err(ConfigError::ConfLine { line: 1, .. })
        ));
    }
}
