//! Block template assembly and the mining thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use utxod_chainstate::{BlockAcceptance, ChainState, TemplateContext};
use utxod_consensus::constants::MAX_FUTURE_BLOCK_TIME;
use utxod_consensus::money::Amount;
use utxod_consensus::{hash256_to_hex, PubKeyHash};
use utxod_pow::{mine, MineOutcome};
use utxod_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use utxod_primitives::transaction::{Transaction, TxOut};
use utxod_storage::KeyValueStore;

use crate::mempool::{lock_pool, Mempool};

/// Room left in a block for the header and the coinbase.
const TEMPLATE_RESERVED_BYTES: usize = 1_000;
/// Margin kept below the future-time limit when the median time past runs
/// ahead of the wall clock.
const FUTURE_TIME_MARGIN: i64 = 60;
const TEMPLATE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub block: Block,
    pub height: u32,
    pub fees: Amount,
}

/// Builds an unsolved block on the current tip: coinbase paying subsidy
/// plus fees to `miner_lock`, then pool transactions in arrival order.
/// Returns `None` when the earliest valid timestamp is too far ahead of the
/// local clock.
pub fn build_template<S: KeyValueStore>(
    chain: &ChainState<S>,
    pool: &Mutex<Mempool>,
    miner_lock: PubKeyHash,
) -> Result<Option<BlockTemplate>, String> {
    let context = chain.template_context().map_err(|err| err.to_string())?;
    let Some(time) = template_time(unix_now(), &context) else {
        return Ok(None);
    };

    let budget = (chain.params().max_block_size as usize).saturating_sub(TEMPLATE_RESERVED_BYTES);
    let selected = lock_pool(pool)
        .map_err(|err| err.to_string())?
        .select_for_block(budget);

    let fees: Amount = selected.iter().map(|entry| entry.fee).sum();
    let coinbase = Transaction::coinbase(
        context.height,
        vec![TxOut {
            value: context.subsidy.saturating_add(fees),
            lock: miner_lock,
        }],
    );
    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(coinbase);
    transactions.extend(selected.into_iter().map(|entry| entry.tx));

    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            prev_block: context.prev_hash,
            merkle_root: [0u8; 32],
            time,
            bits: context.bits,
            nonce: rand::random::<u32>(),
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    Ok(Some(BlockTemplate {
        block,
        height: context.height,
        fees,
    }))
}

fn template_time(now: i64, context: &TemplateContext) -> Option<u32> {
    let min_time = i64::from(context.min_time);
    if min_time > now + MAX_FUTURE_BLOCK_TIME - FUTURE_TIME_MARGIN {
        return None;
    }
    u32::try_from(now.max(min_time)).ok()
}

/// Builds a template, searches a nonce and submits the solved block.
/// `Ok(None)` means the search was cancelled or no template could be built.
pub fn mine_block<S: KeyValueStore>(
    chain: &ChainState<S>,
    pool: &Mutex<Mempool>,
    miner_lock: PubKeyHash,
    cancel: &AtomicBool,
) -> Result<Option<(Block, BlockAcceptance)>, String> {
    let Some(template) = build_template(chain, pool, miner_lock)? else {
        return Ok(None);
    };
    let mut block = template.block;
    match mine(block.header.clone(), chain.params(), cancel).map_err(|err| err.to_string())? {
        MineOutcome::Found(header) => block.header = header,
        MineOutcome::Cancelled => return Ok(None),
        MineOutcome::Exhausted => {
            log_warn!("Miner exhausted the nonce and time space at height {}", template.height);
            return Ok(None);
        }
    }
    let acceptance = chain
        .submit_block(&block.consensus_encode())
        .map_err(|err| err.to_string())?;
    Ok(Some((block, acceptance)))
}

pub struct MinerHandle {
    cancel: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MinerHandle {
    /// Flag the tip listener raises so the current search is abandoned.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn spawn_miner<S: KeyValueStore + 'static>(
    chain: Arc<ChainState<S>>,
    pool: Arc<Mutex<Mempool>>,
    miner_lock: PubKeyHash,
) -> Result<MinerHandle, String> {
    let cancel = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(AtomicBool::new(false));
    let thread_cancel = Arc::clone(&cancel);
    let thread_shutdown = Arc::clone(&shutdown);
    let handle = thread::Builder::new()
        .name("miner".to_string())
        .spawn(move || {
            miner_loop(
                chain.as_ref(),
                pool.as_ref(),
                miner_lock,
                &thread_cancel,
                &thread_shutdown,
            )
        })
        .map_err(|err| format!("failed to spawn miner thread: {err}"))?;
    Ok(MinerHandle {
        cancel,
        shutdown,
        handle: Some(handle),
    })
}

fn miner_loop<S: KeyValueStore>(
    chain: &ChainState<S>,
    pool: &Mutex<Mempool>,
    miner_lock: PubKeyHash,
    cancel: &AtomicBool,
    shutdown: &AtomicBool,
) {
    log_info!("Miner started, paying {}", hex_lock(&miner_lock));
    while !shutdown.load(Ordering::Acquire) {
        cancel.store(false, Ordering::Release);
        match mine_block(chain, pool, miner_lock, cancel) {
            Ok(Some((block, acceptance))) => match acceptance {
                BlockAcceptance::Connected { hash, height } => {
                    log_info!(
                        "Mined block {} at height {} ({} txs)",
                        hash256_to_hex(&hash),
                        height,
                        block.transactions.len()
                    );
                }
                other => log_warn!("Mined block was not connected: {other:?}"),
            },
            Ok(None) => {
                if !cancel.load(Ordering::Acquire) {
                    log_debug!("Block time would run ahead of the clock; waiting");
                    thread::sleep(TEMPLATE_RETRY_DELAY);
                }
            }
            Err(err) => {
                if chain.is_halted() {
                    log_error!("Miner stopping: {err}");
                    break;
                }
                log_warn!("Mining attempt failed: {err}");
                thread::sleep(TEMPLATE_RETRY_DELAY);
            }
        }
    }
    log_info!("Miner stopped");
}

fn hex_lock(lock: &PubKeyHash) -> String {
    lock.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs() as i64)
        .unwrap_or(0)
}
