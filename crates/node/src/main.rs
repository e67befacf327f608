use utxod_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

pub mod import;
pub mod mempool;
pub mod miner;
pub mod store;
pub mod verify;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::sync::watch;
use utxod_chainstate::{ChainState, ChainStateOptions, TipSnapshot};
use utxod_consensus::{chain_params, hash256_to_hex, Network, PubKeyHash};

use crate::mempool::Mempool;
use crate::store::{open_store, Backend};
use crate::verify::VerifyPool;

const DEFAULT_DATA_DIR: &str = "data";
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DEFAULT_VERIFY_QUEUE: usize = 64;
const DEFAULT_MEMPOOL_MAX_MB: u64 = 300;
const DEFAULT_DB_CACHE_MB: u64 = 256;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

#[derive(Clone, Debug)]
struct Config {
    backend: Backend,
    data_dir: PathBuf,
    conf_path: PathBuf,
    network: Network,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
    mine: bool,
    miner_lock: Option<PubKeyHash>,
    verify_workers: usize,
    verify_queue: usize,
    reindex: bool,
    import: Option<PathBuf>,
    db_cache_mb: u64,
    db_fsync_ms: Option<u16>,
    mempool_max_mb: u64,
    status_interval_secs: u64,
}

#[derive(Debug)]
enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

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
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another utxod instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another utxod instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("utxod {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(Instant::now(), *config).await,
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    log_info!(
        "Startup: begin (backend={}, network={}, data_dir={}, conf={})",
        config.backend.as_str(),
        config.network.as_str(),
        config.data_dir.display(),
        config.conf_path.display()
    );
    let params = chain_params(config.network);
    let data_dir = &config.data_dir;
    let db_path = data_dir.join("db");

    fs::create_dir_all(data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(data_dir)?;

    let cache_bytes = (config.db_cache_mb > 0).then(|| mb_to_bytes(config.db_cache_mb));
    let store = Arc::new(open_store(
        config.backend,
        &db_path,
        cache_bytes,
        config.db_fsync_ms,
    )?);
    let chain = Arc::new(
        ChainState::open(
            Arc::clone(&store),
            params.consensus.clone(),
            ChainStateOptions::from_chain_params(&params),
        )
        .map_err(|err| format!("failed to open chain state: {err}"))?,
    );

    if config.reindex {
        log_info!("Reindex requested; rebuilding the UTXO set from stored blocks");
        chain
            .reindex_utxos()
            .map_err(|err| format!("reindex failed: {err}"))?;
    }
    let tip = chain.tip().map_err(|err| err.to_string())?;
    log_info!(
        "Chain tip at height {} ({})",
        tip.height,
        hash256_to_hex(&tip.hash)
    );

    let mempool = Arc::new(Mutex::new(Mempool::new(
        usize::try_from(mb_to_bytes(config.mempool_max_mb)).unwrap_or(usize::MAX),
    )));
    let verify_workers = resolve_verify_workers(config.verify_workers);
    let verify = Arc::new(VerifyPool::start(
        Arc::clone(&chain),
        verify_workers,
        config.verify_queue,
    )?);
    log_info!(
        "Verify pool: {} workers, queue {}",
        verify_workers,
        config.verify_queue
    );

    let miner = match (config.mine, config.miner_lock) {
        (true, Some(lock)) => Some(miner::spawn_miner(
            Arc::clone(&chain),
            Arc::clone(&mempool),
            lock,
        )?),
        _ => None,
    };

    let (tip_tx, tip_rx) = crossbeam_channel::unbounded::<TipSnapshot>();
    let listener_id = {
        let miner_cancel = miner.as_ref().map(|miner| miner.cancel_flag());
        chain.on_new_tip(move |tip| {
            if let Some(cancel) = &miner_cancel {
                cancel.store(true, Ordering::Release);
            }
            let _ = tip_tx.send(*tip);
        })
    };
    let maintenance = {
        let chain = Arc::clone(&chain);
        let mempool = Arc::clone(&mempool);
        thread::Builder::new()
            .name("mempool-maint".to_string())
            .spawn(move || {
                while let Ok(mut tip) = tip_rx.recv() {
                    while let Ok(next) = tip_rx.try_recv() {
                        tip = next;
                    }
                    match mempool::prune(chain.as_ref(), mempool.as_ref()) {
                        Ok(0) => {}
                        Ok(removed) => log_debug!(
                            "Removed {removed} mempool entries after tip {}",
                            tip.height
                        ),
                        Err(err) => log_warn!("Mempool prune failed: {err}"),
                    }
                }
            })
            .map_err(|err| format!("failed to spawn mempool thread: {err}"))?
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        let _ = shutdown_tx.send(true);
    });

    let import_cancel = Arc::new(AtomicBool::new(false));
    let mut import_task = config.import.clone().map(|path| {
        log_info!("Importing blocks from {}", path.display());
        let verify = Arc::clone(&verify);
        let cancel = Arc::clone(&import_cancel);
        let max_in_flight = config.verify_queue.saturating_mul(2);
        tokio::task::spawn_blocking(move || {
            import::import_file(verify.as_ref(), &path, max_in_flight, &cancel)
        })
    });

    let mut result = Ok(());
    let mut ticker = tokio::time::interval(Duration::from_secs(
        config.status_interval_secs.max(1),
    ));
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            joined = async {
                match import_task.as_mut() {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            } => {
                import_task = None;
                match joined {
                    Ok(Ok(summary)) => log_info!(
                        "Import done: {} submitted, {} connected, {} side branch, {} duplicate, {} orphan, {} rejected",
                        summary.submitted,
                        summary.connected,
                        summary.side_branch,
                        summary.duplicate,
                        summary.orphan_pending,
                        summary.rejected
                    ),
                    Ok(Err(err)) => {
                        result = Err(err);
                        break;
                    }
                    Err(err) => {
                        result = Err(format!("import task failed: {err}"));
                        break;
                    }
                }
                if !config.mine {
                    break;
                }
            }
            _ = ticker.tick(), if config.status_interval_secs > 0 => {
                if chain.is_halted() {
                    result = Err("chain state halted after a fatal error".to_string());
                    break;
                }
                log_status(chain.as_ref(), mempool.as_ref(), start_time);
            }
        }
    }

    log_info!("Shutdown: stopping workers");
    import_cancel.store(true, Ordering::Release);
    if let Some(task) = import_task {
        let _ = task.await;
    }
    if let Some(miner) = miner {
        miner.stop();
    }
    chain.remove_tip_listener(listener_id);
    let _ = maintenance.join();
    verify.shutdown();
    if let Err(err) = store.persist() {
        log_error!("failed to persist store: {err}");
        if result.is_ok() {
            result = Err(format!("failed to persist store: {err}"));
        }
    }
    if chain.is_halted() && result.is_ok() {
        result = Err("chain state halted after a fatal error".to_string());
    }
    let tip = chain.tip().ok();
    log_info!(
        "Shutdown complete at height {}",
        tip.map(|tip| tip.height.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    result
}

fn log_status<S: utxod_storage::KeyValueStore>(
    chain: &ChainState<S>,
    mempool: &Mutex<Mempool>,
    start_time: Instant,
) {
    let tip = match chain.tip() {
        Ok(tip) => tip,
        Err(err) => {
            log_warn!("Status unavailable: {err}");
            return;
        }
    };
    let orphans = chain.orphan_count().unwrap_or(0);
    let (txs, bytes) = match mempool.lock() {
        Ok(pool) => (pool.size(), pool.bytes()),
        Err(_) => (0, 0),
    };
    log_info!(
        "Status: height {} tip {} orphans {} mempool {} txs {} bytes uptime {}s",
        tip.height,
        hash256_to_hex(&tip.hash),
        orphans,
        txs,
        bytes,
        start_time.elapsed().as_secs()
    );
}

fn resolve_verify_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut mine = false;
    let mut mine_set = false;
    let mut miner_lock: Option<PubKeyHash> = None;
    let mut miner_lock_set = false;
    let mut verify_workers: usize = 0;
    let mut verify_workers_set = false;
    let mut verify_queue: usize = DEFAULT_VERIFY_QUEUE;
    let mut verify_queue_set = false;
    let mut reindex = false;
    let mut import: Option<PathBuf> = None;
    let mut db_cache_mb: u64 = DEFAULT_DB_CACHE_MB;
    let mut db_cache_set = false;
    let mut db_fsync_ms: Option<u16> = None;
    let mut db_fsync_ms_set = false;
    let mut mempool_max_mb: u64 = DEFAULT_MEMPOOL_MAX_MB;
    let mut mempool_max_mb_set = false;
    let mut status_interval_secs: u64 = DEFAULT_STATUS_INTERVAL_SECS;
    let mut status_interval_set = false;
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
                network_set = true;
            }
            "--regtest" => {
                network = Network::Regtest;
                network_set = true;
            }
            "--testnet" => {
                network = Network::Testnet;
                network_set = true;
            }
            "--log-level" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            "--mine" => {
                mine = true;
                mine_set = true;
            }
            "--miner-lock" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --miner-lock\n{}", usage()))?;
                miner_lock = Some(
                    parse_pubkey_hash(&value)
                        .ok_or_else(|| format!("invalid miner lock '{value}'\n{}", usage()))?,
                );
                miner_lock_set = true;
            }
            "--verify-workers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --verify-workers\n{}", usage()))?;
                verify_workers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid verify workers '{value}'\n{}", usage()))?;
                verify_workers_set = true;
            }
            "--verify-queue" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --verify-queue\n{}", usage()))?;
                verify_queue = value
                    .parse::<usize>()
                    .ok()
                    .filter(|value| *value > 0)
                    .ok_or_else(|| format!("invalid verify queue '{value}'\n{}", usage()))?;
                verify_queue_set = true;
            }
            "--reindex" => {
                reindex = true;
            }
            "--import" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --import\n{}", usage()))?;
                import = Some(PathBuf::from(value));
            }
            "--db-cache-mb" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --db-cache-mb\n{}", usage()))?;
                db_cache_mb = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid db cache '{value}'\n{}", usage()))?;
                db_cache_set = true;
            }
            "--db-fsync-ms" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --db-fsync-ms\n{}", usage()))?;
                db_fsync_ms = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| format!("invalid db fsync ms '{value}'\n{}", usage()))?,
                );
                db_fsync_ms_set = true;
            }
            "--mempool-max-mb" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --mempool-max-mb\n{}", usage()))?;
                mempool_max_mb = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid mempool max '{value}'\n{}", usage()))?;
                mempool_max_mb_set = true;
            }
            "--status-interval" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --status-interval\n{}", usage()))?;
                status_interval_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid status interval '{value}'\n{}", usage()))?;
                status_interval_set = true;
            }
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_explicit = conf_path.is_some();
    let conf_file =
        conf_path.unwrap_or_else(|| data_dir.join(chain_params(network).conf_file_name));

    match load_conf(&conf_file)? {
        Some(conf) => {
            let last = |key: &str| conf.get(key).and_then(|values| values.last());
            let invalid = |key: &str, raw: &str| {
                format!("invalid {key} '{raw}' in {}", conf_file.display())
            };

            if !network_set {
                if let Some(raw) = last("network") {
                    network = Network::parse(raw).ok_or_else(|| invalid("network", raw))?;
                } else if last("regtest").and_then(|raw| parse_conf_bool(raw)) == Some(true) {
                    network = Network::Regtest;
                } else if last("testnet").and_then(|raw| parse_conf_bool(raw)) == Some(true) {
                    network = Network::Testnet;
                }
            }
            if !backend_set {
                if let Some(raw) = last("backend") {
                    backend = Backend::parse(raw).ok_or_else(|| invalid("backend", raw))?;
                }
            }
            if !log_level_set {
                if let Some(raw) = last("loglevel") {
                    log_level = logging::Level::parse(raw).ok_or_else(|| invalid("loglevel", raw))?;
                }
            }
            if !log_format_set {
                if let Some(raw) = last("logformat") {
                    log_format =
                        logging::Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?;
                }
            }
            if !log_timestamps_set {
                if let Some(raw) = last("logtimestamps") {
                    log_timestamps =
                        parse_conf_bool(raw).ok_or_else(|| invalid("logtimestamps", raw))?;
                }
            }
            if !mine_set {
                if let Some(raw) = last("mine") {
                    mine = parse_conf_bool(raw).ok_or_else(|| invalid("mine", raw))?;
                }
            }
            if !miner_lock_set {
                if let Some(raw) = last("minerlock") {
                    miner_lock =
                        Some(parse_pubkey_hash(raw).ok_or_else(|| invalid("minerlock", raw))?);
                }
            }
            if !verify_workers_set {
                if let Some(raw) = last("verifyworkers") {
                    verify_workers = raw
                        .parse::<usize>()
                        .map_err(|_| invalid("verifyworkers", raw))?;
                }
            }
            if !verify_queue_set {
                if let Some(raw) = last("verifyqueue") {
                    verify_queue = raw
                        .parse::<usize>()
                        .ok()
                        .filter(|value| *value > 0)
                        .ok_or_else(|| invalid("verifyqueue", raw))?;
                }
            }
            if !db_cache_set {
                if let Some(raw) = last("dbcache") {
                    db_cache_mb = raw.parse::<u64>().map_err(|_| invalid("dbcache", raw))?;
                }
            }
            if !db_fsync_ms_set {
                if let Some(raw) = last("dbfsyncms") {
                    db_fsync_ms =
                        Some(raw.parse::<u16>().map_err(|_| invalid("dbfsyncms", raw))?);
                }
            }
            if !mempool_max_mb_set {
                if let Some(raw) = last("maxmempool") {
                    mempool_max_mb = raw.parse::<u64>().map_err(|_| invalid("maxmempool", raw))?;
                }
            }
            if !status_interval_set {
                if let Some(raw) = last("statusinterval") {
                    status_interval_secs = raw
                        .parse::<u64>()
                        .map_err(|_| invalid("statusinterval", raw))?;
                }
            }
        }
        None if conf_explicit => {
            return Err(format!("config file {} not found", conf_file.display()));
        }
        None => {}
    }

    if mine && miner_lock.is_none() {
        return Err(format!("--mine requires --miner-lock\n{}", usage()));
    }

    Ok(CliAction::Run(Box::new(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        log_level,
        log_format,
        log_timestamps,
        mine,
        miner_lock,
        verify_workers,
        verify_queue,
        reindex,
        import,
        db_cache_mb,
        db_fsync_ms,
        mempool_max_mb,
        status_interval_secs,
    })))
}

/// Reads `key=value` lines. `#` and `;` start comments, a bare key means
/// `1`, keys are case-insensitive. Returns `None` if the file is absent.
fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

pub(crate) fn parse_hex_bytes(value: &str) -> Option<Vec<u8>> {
    let mut hex = value.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() % 2 == 1 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.as_bytes().iter().copied();
    while let (Some(high), Some(low)) = (iter.next(), iter.next()) {
        let high = (high as char).to_digit(16)? as u8;
        let low = (low as char).to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

fn parse_pubkey_hash(value: &str) -> Option<PubKeyHash> {
    parse_hex_bytes(value)?.try_into().ok()
}

fn usage() -> String {
    [
        "Usage:",
        "  utxod [options]",
        "  utxod <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --data-dir <dir>  Base data directory (default: ./data)",
        "  --conf <file>  Config file path (default: <data-dir>/utxod.conf)",
        "  --backend <memory|fjall>  Storage backend (default: fjall)",
        "  --network <mainnet|testnet|regtest>  Chain to run (default: mainnet)",
        "  --testnet  Shorthand for --network testnet",
        "  --regtest  Shorthand for --network regtest",
        "  --log-level <level>  error|warn|info|debug|trace (default: info)",
        "  --log-format <text|json>  Log output format (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --mine  Run the miner thread (requires --miner-lock)",
        "  --miner-lock <hex>  20-byte pubkey hash receiving block rewards",
        "  --verify-workers <n>  Block prevalidation threads (default: cores - 1)",
        "  --verify-queue <n>  Pending blocks before submitters wait (default: 64)",
        "  --reindex  Rebuild the UTXO set from stored blocks before starting",
        "  --import <file>  Submit hex-encoded blocks from <file>, one per line",
        "  --db-cache-mb <n>  fjall block cache size (default: 256)",
        "  --db-fsync-ms <n>  fjall journal fsync interval",
        "  --mempool-max-mb <n>  Mempool size limit, 0 for none (default: 300)",
        "  --status-interval <secs>  Status log interval, 0 to disable (default: 30)",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(values: &[&str]) -> Config {
        match parse_args_from(args(values)).expect("parse") {
            CliAction::Run(config) => *config,
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn defaults_without_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8").to_string();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.log_level, logging::Level::Info);
        assert!(config.log_timestamps);
        assert!(!config.mine);
        assert_eq!(config.verify_queue, DEFAULT_VERIFY_QUEUE);
        assert_eq!(config.conf_path, dir.path().join("utxod.conf"));
        assert_eq!(config.import, None);
    }

    #[test]
    fn command_line_flags_parse() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8").to_string();
        let lock = "0x".to_string() + &"ab".repeat(20);
        let config = run_config(&[
            "--data-dir",
            &data_dir,
            "--regtest",
            "--backend",
            "memory",
            "--log-format",
            "json",
            "--no-log-timestamps",
            "--mine",
            "--miner-lock",
            &lock,
            "--verify-workers",
            "3",
            "--import",
            "blocks.hex",
            "--db-fsync-ms",
            "250",
            "--reindex",
        ]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.log_format, logging::Format::Json);
        assert!(!config.log_timestamps);
        assert!(config.mine);
        assert_eq!(config.miner_lock, Some([0xab; 20]));
        assert_eq!(config.verify_workers, 3);
        assert_eq!(config.import, Some(PathBuf::from("blocks.hex")));
        assert_eq!(config.db_fsync_ms, Some(250));
        assert!(config.reindex);
    }

    #[test]
    fn command_line_overrides_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("utxod.conf");
        fs::write(
            &conf,
            "# node settings\nregtest\nloglevel=debug ; noisy\nloglevel = trace\nbackend=memory\nmine=1\nminerlock=0101010101010101010101010101010101010101\ndbcache=64\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_str().expect("utf8").to_string();
        let config = run_config(&["--data-dir", &data_dir, "--backend", "fjall"]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.log_level, logging::Level::Trace);
        assert_eq!(config.backend, Backend::Fjall);
        assert!(config.mine);
        assert_eq!(config.miner_lock, Some([1u8; 20]));
        assert_eq!(config.db_cache_mb, 64);

        let config = run_config(&["--data-dir", &data_dir, "--log-level", "warn", "--testnet"]);
        assert_eq!(config.log_level, logging::Level::Warn);
        assert_eq!(config.network, Network::Testnet);
    }

    #[test]
    fn invalid_input_is_reported() {
        let err = parse_args_from(args(&["--backend"])).expect_err("missing value");
        assert!(err.starts_with("missing value for --backend"));

        let err = parse_args_from(args(&["--miner-lock", "abcd"])).expect_err("short lock");
        assert!(err.starts_with("invalid miner lock 'abcd'"));

        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8").to_string();
        let err = parse_args_from(args(&["--data-dir", &data_dir, "--mine"])).expect_err("no lock");
        assert!(err.starts_with("--mine requires --miner-lock"));

        let err = parse_args_from(args(&["--frobnicate"])).expect_err("unknown");
        assert!(err.starts_with("unknown argument '--frobnicate'"));

        let missing = dir.path().join("absent.conf");
        let missing = missing.to_str().expect("utf8").to_string();
        let err = parse_args_from(args(&["--conf", &missing])).expect_err("missing conf");
        assert!(err.contains("not found"));

        fs::write(dir.path().join("utxod.conf"), "verifyqueue=0\n").expect("write conf");
        let err = parse_args_from(args(&["--data-dir", &data_dir])).expect_err("bad conf");
        assert!(err.starts_with("invalid verifyqueue '0'"));
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(args(&["help"])),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(args(&["--regtest", "-V"])),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex_bytes("0x0aFf"), Some(vec![0x0a, 0xff]));
        assert_eq!(parse_hex_bytes("abc"), None);
        assert_eq!(parse_hex_bytes("zz"), None);
        assert_eq!(parse_pubkey_hash(&"00".repeat(20)), Some([0u8; 20]));
        assert_eq!(parse_pubkey_hash(&"00".repeat(21)), None);
    }

    #[test]
    fn data_dir_lock_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let held = lock_data_dir(dir.path()).expect("first lock");
        let err = match lock_data_dir(dir.path()) {
            Ok(_) => panic!("second lock succeeded"),
            Err(err) => err,
        };
        assert!(err.contains("already locked"));
        assert!(err.contains("pid="));
        drop(held);
        lock_data_dir(dir.path()).expect("relock");
    }
}
