//! Process lifecycle for `zcored`: settings, data directory lock, store, context, shutdown.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;
use zcore_chainstate::blockindex::BlockIndexEntry;
use zcore_chainstate::{ChainState, CheckQueue, TemplateVerifier};
use zcore_consensus::hash256_to_hex;
use zcore_mempool::{Mempool, MempoolEntry, MempoolPolicy};
use zcore_primitives::block::Block;
use zcore_primitives::transaction::Transaction;
use zcore_shielded::{load_params, ParamsSet};
use zcore_storage::fjall::FjallStore;
use zcore_storage::memory::MemoryStore;
use zcore_storage::KeyValueStore;

use crate::config::{parse_args, usage, Backend, CliAction, Config};
use crate::context::ValidationContext;
use crate::import::import_blocks;
use crate::notify::{ObserverResult, ValidationObserver};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

/// Held for the life of the process; dropping it releases the lock.
struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ = File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            Err(format!(
                "data dir {} is in use by another zcored ({})",
                data_dir.display(),
                holder.trim()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {}: {err}",
            data_dir.display()
        )),
    }
}

/// Logs every validation event at info level.
struct LoggingObserver;

impl ValidationObserver for LoggingObserver {
    fn name(&self) -> &str {
        "log"
    }

    fn block_connected(&self, block: &Block, entry: &BlockIndexEntry) -> ObserverResult {
        zcore_log::log_info!(
            "connected block {} at height {} ({} txs)",
            hash256_to_hex(&entry.hash),
            entry.height,
            block.transactions.len()
        );
        Ok(())
    }

    fn block_disconnected(&self, block: &Block) -> ObserverResult {
        zcore_log::log_info!("disconnected block {}", hash256_to_hex(&block.hash()));
        Ok(())
    }

    fn tx_accepted_to_pool(&self, _tx: &Transaction, entry: &MempoolEntry) -> ObserverResult {
        zcore_log::log_info!(
            "accepted {} to mempool (fee {}, {} bytes)",
            hash256_to_hex(&entry.txid),
            entry.fee,
            entry.size
        );
        Ok(())
    }
}

pub async fn run_entry() -> Result<(), String> {
    let config = match parse_args().map_err(|err| format!("{err}\n\n{}", usage()))? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("zcored {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliAction::Run(config) => config,
    };

    zcore_log::init(zcore_log::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;
    zcore_log::log_info!(
        "Starting zcored on {} (data dir {})",
        config.network.as_str(),
        config.data_dir.display()
    );

    match config.backend {
        Backend::Memory => run_node(&config, Arc::new(MemoryStore::new())).await,
        Backend::Fjall => {
            let store = FjallStore::open(config.db_dir()).map_err(|err| {
                format!("failed to open store {}: {err}", config.db_dir().display())
            })?;
            run_node(&config, Arc::new(store)).await
        }
    }
}

async fn run_node<S: KeyValueStore + 'static>(config: &Config, store: Arc<S>) -> Result<(), String> {
    if config.load_params {
        let expected = ParamsSet::for_network(config.network).map_err(|err| err.to_string())?;
        let loaded = load_params(&config.params_dir, config.network, &expected)
            .map_err(|err| format!("shielded parameters: {err}"))?;
        zcore_log::log_info!(
            "proving parameters loaded: {} files, {} bytes",
            loaded.paths.len(),
            loaded.total_bytes
        );
        zcore_log::log_warn!(
            "no proof verifier is available; shielded transactions will be rejected"
        );
    }

    let queue = CheckQueue::new(config.par, Arc::new(TemplateVerifier))
        .map_err(|err| format!("failed to start script check threads: {err}"))?;
    let chain = ChainState::open(
        store,
        config.blocks_dir(),
        config.consensus_params(),
        Arc::new(queue),
    )
    .map_err(|err| format!("failed to open chain state: {err}"))?;
    let ctx = Arc::new(ValidationContext::new(
        chain,
        Mempool::new(config.max_mempool_bytes),
        MempoolPolicy::default(),
    ));
    ctx.register(Arc::new(LoggingObserver));

    for path in &config.load_blocks {
        let importer = Arc::clone(&ctx);
        let path = path.clone();
        let imported = tokio::task::spawn_blocking(move || import_blocks(&importer, &path))
            .await
            .map_err(|err| format!("import task failed: {err}"))?;
        if let Err(err) = imported {
            ctx.shutdown();
            return Err(format!("block import failed: {err}"));
        }
    }

    match ctx.tip() {
        Some(tip) => zcore_log::log_info!(
            "Ready at height {} ({})",
            tip.height,
            hash256_to_hex(&tip.hash)
        ),
        None => zcore_log::log_info!("Ready with an empty chain"),
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        zcore_log::log_warn!("failed to listen for Ctrl-C: {err}");
    } else {
        zcore_log::log_info!("Signal received; shutting down.");
    }
    tokio::task::spawn_blocking(move || ctx.shutdown())
        .await
        .map_err(|err| format!("shutdown task failed: {err}"))?;
    Ok(())
}
