use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use utxod_chainstate::validation::{check_transaction, verify_transaction_signatures};
use utxod_chainstate::{ChainState, UtxoError, UtxoSet};
use utxod_consensus::money::{money_range, Amount};
use utxod_consensus::{hash256_to_hex, Hash256};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::Transaction;
use utxod_storage::KeyValueStore;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    ConflictingInput,
    MissingInput,
    MempoolFull,
    InvalidTransaction,
    InvalidSignature,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

/// Txid of the accepted transaction, or why it was refused.
pub type MempoolResult = Result<Hash256, MempoolError>;

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    pub time: u64,
    /// Tip height when the entry was accepted.
    pub height: u32,
    pub fee: Amount,
    sequence: u64,
}

impl MempoolEntry {
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn spent_outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.tx.vin.iter().map(|input| &input.prevout)
    }
}

/// Transactions waiting for a block. Every entry spends confirmed outputs
/// only, and no two entries claim the same outpoint.
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    total_bytes: usize,
    max_bytes: usize,
    next_sequence: u64,
}

impl Mempool {
    /// `max_bytes == 0` disables the size limit.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            next_sequence: 0,
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn insert(&mut self, entry: MempoolEntry) -> Result<(), MempoolError> {
        if self.entries.contains_key(&entry.txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "transaction already in mempool",
            ));
        }
        for outpoint in entry.spent_outpoints() {
            if let Some(conflict) = self.spent.get(outpoint) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    format!(
                        "input {}:{} already spent by {}",
                        hash256_to_hex(&outpoint.hash),
                        outpoint.index,
                        hash256_to_hex(conflict)
                    ),
                ));
            }
        }
        if self.max_bytes > 0 && self.total_bytes.saturating_add(entry.size()) > self.max_bytes {
            return Err(MempoolError::new(
                MempoolErrorKind::MempoolFull,
                "mempool full",
            ));
        }

        let mut entry = entry;
        entry.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        for outpoint in entry.spent_outpoints() {
            self.spent.insert(*outpoint, entry.txid);
        }
        self.total_bytes = self.total_bytes.saturating_add(entry.size());
        self.entries.insert(entry.txid, entry);
        Ok(())
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size());
        for outpoint in entry.spent_outpoints() {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        Some(entry)
    }

    /// Drops every entry whose inputs no longer resolve against `utxos` at
    /// `spend_height`. Entries confirmed by the new tip go this way too,
    /// since their inputs are now spent.
    pub fn retain_spendable(
        &mut self,
        utxos: &UtxoSet,
        spend_height: u32,
        maturity: u32,
    ) -> Vec<MempoolEntry> {
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| {
                entry.tx.vin.iter().any(|input| {
                    utxos
                        .resolve_input(&input.prevout, &input.pubkey, spend_height, maturity)
                        .is_err()
                })
            })
            .map(|entry| entry.txid)
            .collect();
        stale
            .iter()
            .filter_map(|txid| self.remove(txid))
            .collect()
    }

    /// Entries in arrival order, skipping any that would push the total
    /// past `max_bytes`.
    pub fn select_for_block(&self, max_bytes: usize) -> Vec<MempoolEntry> {
        let mut ordered: Vec<&MempoolEntry> = self.entries.values().collect();
        ordered.sort_by_key(|entry| entry.sequence);
        let mut used = 0usize;
        let mut selected = Vec::new();
        for entry in ordered {
            let next = used.saturating_add(entry.size());
            if next > max_bytes {
                continue;
            }
            used = next;
            selected.push(entry.clone());
        }
        selected
    }
}

/// Admits a serialized transaction: it must decode, pass the context-free
/// checks and signature checks, spend only unspent confirmed outputs not
/// already claimed by the pool, and not create value.
pub fn submit_transaction<S: KeyValueStore>(
    chain: &ChainState<S>,
    pool: &Mutex<Mempool>,
    bytes: &[u8],
) -> MempoolResult {
    let tx = Transaction::consensus_decode(bytes).map_err(|err| {
        MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            format!("malformed transaction: {err}"),
        )
    })?;
    if tx.is_coinbase() {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "coinbase transaction outside a block",
        ));
    }
    check_transaction(&tx)
        .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidTransaction, err.reason()))?;

    let txid = tx.txid();
    if lock_pool(pool)?.contains(&txid) {
        return Err(MempoolError::new(
            MempoolErrorKind::AlreadyInMempool,
            "transaction already in mempool",
        ));
    }

    verify_transaction_signatures(&tx)
        .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidSignature, err.to_string()))?;

    let maturity = chain.params().coinbase_maturity;
    let (value_in, height) = chain
        .with_utxos(|utxos, tip| {
            let spend_height = tip.height.saturating_add(1);
            sum_inputs(utxos, &tx, spend_height, maturity).map(|value| (value, tip.height))
        })
        .map_err(|err| MempoolError::new(MempoolErrorKind::Internal, err.to_string()))??;

    let value_out = tx.total_output_value().ok_or_else(|| {
        MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "value out of money range",
        )
    })?;
    if value_in < value_out {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            UtxoError::InsufficientValue.reason(),
        ));
    }

    let entry = MempoolEntry {
        txid,
        tx,
        raw: bytes.to_vec(),
        time: now_secs(),
        height,
        fee: value_in - value_out,
        sequence: 0,
    };
    lock_pool(pool)?.insert(entry)?;
    Ok(txid)
}

/// Removes entries the current tip made unspendable. Returns how many went.
pub fn prune<S: KeyValueStore>(
    chain: &ChainState<S>,
    pool: &Mutex<Mempool>,
) -> Result<usize, MempoolError> {
    let maturity = chain.params().coinbase_maturity;
    let mut guard = lock_pool(pool)?;
    let removed = chain
        .with_utxos(|utxos, tip| {
            guard.retain_spendable(utxos, tip.height.saturating_add(1), maturity)
        })
        .map_err(|err| MempoolError::new(MempoolErrorKind::Internal, err.to_string()))?;
    Ok(removed.len())
}

pub(crate) fn lock_pool(
    pool: &Mutex<Mempool>,
) -> Result<std::sync::MutexGuard<'_, Mempool>, MempoolError> {
    pool.lock()
        .map_err(|_| MempoolError::new(MempoolErrorKind::Internal, "mempool lock poisoned"))
}

fn sum_inputs(
    utxos: &UtxoSet,
    tx: &Transaction,
    spend_height: u32,
    maturity: u32,
) -> Result<Amount, MempoolError> {
    let mut total: Amount = 0;
    for input in &tx.vin {
        let entry = utxos
            .resolve_input(&input.prevout, &input.pubkey, spend_height, maturity)
            .map_err(input_error)?;
        total = total
            .checked_add(entry.value)
            .filter(|value| money_range(*value))
            .ok_or_else(|| {
                MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    UtxoError::ValueOutOfRange.reason(),
                )
            })?;
    }
    Ok(total)
}

fn input_error(err: UtxoError) -> MempoolError {
    let kind = match err {
        UtxoError::UnknownInput(_) => MempoolErrorKind::MissingInput,
        UtxoError::DoubleSpend(_) => MempoolErrorKind::ConflictingInput,
        _ => MempoolErrorKind::InvalidTransaction,
    };
    MempoolError::new(kind, err.reason())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}
