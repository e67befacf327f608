//! In-memory UTXO set with undo-based rollback and a per-lock balance index.

use std::collections::{HashMap, HashSet};

use utxod_consensus::money::{money_range, Amount};
use utxod_consensus::{block_subsidy, hash256_to_hex, ConsensusParams, Hash256, PubKeyHash};
use utxod_primitives::block::Block;
use utxod_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxod_primitives::outpoint::OutPoint;
use utxod_script::lock_for_pubkey;
use utxod_storage::{Column, KeyValueStore, WriteBatch};

use crate::state::ChainStateError;
use crate::undo::{SpentOutput, UndoRecord};

pub const UTXO_ENTRY_LEN: usize = 8 + 20 + 4 + 1;

const FLAG_COINBASE: u8 = 0x01;
const FLAG_SPENT: u8 = 0x02;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub lock: PubKeyHash,
    pub height: u32,
    pub is_coinbase: bool,
    pub spent: bool,
}

impl UtxoEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(UTXO_ENTRY_LEN);
        encoder.write_i64_le(self.value);
        encoder.write_bytes(&self.lock);
        encoder.write_u32_le(self.height);
        let mut flags = 0u8;
        if self.is_coinbase {
            flags |= FLAG_COINBASE;
        }
        if self.spent {
            flags |= FLAG_SPENT;
        }
        encoder.write_u8(flags);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let lock = decoder.read_fixed::<20>()?;
        let height = decoder.read_u32_le()?;
        let flags = decoder.read_u8()?;
        if flags & !(FLAG_COINBASE | FLAG_SPENT) != 0 {
            return Err(DecodeError::InvalidData("unknown utxo flags"));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            lock,
            height,
            is_coinbase: flags & FLAG_COINBASE != 0,
            spent: flags & FLAG_SPENT != 0,
        })
    }

    /// Whether a coinbase output created at `self.height` may be spent in a
    /// block at `spend_height`. Non-coinbase outputs are always mature.
    pub fn is_mature(&self, spend_height: u32, maturity: u32) -> bool {
        !self.is_coinbase || spend_height.saturating_sub(self.height) >= maturity
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UtxoError {
    UnknownInput(OutPoint),
    DoubleSpend(OutPoint),
    LockMismatch(OutPoint),
    ImmatureCoinbase(OutPoint),
    InsufficientValue,
    ValueOutOfRange,
    DuplicateOutput(OutPoint),
    CoinbaseOverpay,
}

impl UtxoError {
    pub fn reason(&self) -> &'static str {
        match self {
            UtxoError::UnknownInput(_) => "input spends unknown output",
            UtxoError::DoubleSpend(_) => "input spends already spent output",
            UtxoError::LockMismatch(_) => "pubkey does not match output lock",
            UtxoError::ImmatureCoinbase(_) => "premature spend of coinbase output",
            UtxoError::InsufficientValue => "inputs do not cover outputs",
            UtxoError::ValueOutOfRange => "value out of money range",
            UtxoError::DuplicateOutput(_) => "output already exists",
            UtxoError::CoinbaseOverpay => "coinbase pays more than subsidy and fees",
        }
    }
}

impl std::fmt::Display for UtxoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtxoError::UnknownInput(outpoint)
            | UtxoError::DoubleSpend(outpoint)
            | UtxoError::LockMismatch(outpoint)
            | UtxoError::ImmatureCoinbase(outpoint)
            | UtxoError::DuplicateOutput(outpoint) => write!(
                f,
                "{} ({}:{})",
                self.reason(),
                hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            _ => write!(f, "{}", self.reason()),
        }
    }
}

impl std::error::Error for UtxoError {}

/// Every output ever created on the active chain, keyed by outpoint.
///
/// Spent outputs stay in the map with `spent = true` until the block that
/// created them is rolled back. Every mutation goes through `set_entry`, which
/// keeps the balance index and the dirty set in step with the map.
#[derive(Default)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
    balances: HashMap<PubKeyHash, Amount>,
    dirty: HashSet<OutPoint>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the set from the persisted `Column::Utxo` snapshot.
    pub fn load<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self, ChainStateError> {
        let mut set = Self::new();
        let mut corrupt: Option<&'static str> = None;
        store.for_each_prefix(Column::Utxo, &[], &mut |key: &[u8], value: &[u8]| {
            if corrupt.is_some() {
                return Ok(());
            }
            let Some(outpoint) = OutPoint::from_key(key) else {
                corrupt = Some("invalid utxo key");
                return Ok(());
            };
            match UtxoEntry::decode(value) {
                Ok(entry) => {
                    if !entry.spent {
                        set.credit(entry.lock, entry.value);
                    }
                    set.entries.insert(outpoint, entry);
                }
                Err(_) => corrupt = Some("invalid utxo entry"),
            }
            Ok(())
        })?;
        match corrupt {
            Some(message) => Err(ChainStateError::Corrupt(message)),
            None => Ok(set),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter()
    }

    /// Sum of unspent values locked to `lock`.
    pub fn balance(&self, lock: &PubKeyHash) -> Amount {
        self.balances.get(lock).copied().unwrap_or(0)
    }

    /// Keys touched since the last `flush_dirty`.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Resolves one input against the set: the output must exist, be
    /// unspent, be locked to `pubkey` and be mature at `spend_height`.
    pub fn resolve_input(
        &self,
        outpoint: &OutPoint,
        pubkey: &[u8],
        spend_height: u32,
        maturity: u32,
    ) -> Result<&UtxoEntry, UtxoError> {
        let entry = self
            .entries
            .get(outpoint)
            .ok_or(UtxoError::UnknownInput(*outpoint))?;
        if entry.spent {
            return Err(UtxoError::DoubleSpend(*outpoint));
        }
        if lock_for_pubkey(pubkey) != entry.lock {
            return Err(UtxoError::LockMismatch(*outpoint));
        }
        if !entry.is_mature(spend_height, maturity) {
            return Err(UtxoError::ImmatureCoinbase(*outpoint));
        }
        Ok(entry)
    }

    /// Connects `block` at `height`. `txids` must be the block's txids in
    /// order. On error every change made so far is undone before returning.
    pub fn apply(
        &mut self,
        block: &Block,
        txids: &[Hash256],
        height: u32,
        params: &ConsensusParams,
    ) -> Result<UndoRecord, UtxoError> {
        let mut undo = UndoRecord::default();
        if let Err(err) = self.connect_transactions(block, txids, height, params, &mut undo) {
            self.rollback(&undo);
            return Err(err);
        }
        Ok(undo)
    }

    fn connect_transactions(
        &mut self,
        block: &Block,
        txids: &[Hash256],
        height: u32,
        params: &ConsensusParams,
        undo: &mut UndoRecord,
    ) -> Result<(), UtxoError> {
        let mut fees: Amount = 0;
        for (tx, txid) in block.transactions.iter().zip(txids) {
            if !tx.is_coinbase() {
                let mut input_total: Amount = 0;
                for input in &tx.vin {
                    let entry = self
                        .resolve_input(
                            &input.prevout,
                            &input.pubkey,
                            height,
                            params.coinbase_maturity,
                        )?
                        .clone();
                    input_total = input_total
                        .checked_add(entry.value)
                        .filter(|total| money_range(*total))
                        .ok_or(UtxoError::ValueOutOfRange)?;
                    let spent = UtxoEntry {
                        spent: true,
                        ..entry.clone()
                    };
                    undo.spent.push(SpentOutput {
                        outpoint: input.prevout,
                        entry,
                    });
                    self.set_entry(input.prevout, Some(spent));
                }
                let output_total = tx.total_output_value().ok_or(UtxoError::ValueOutOfRange)?;
                if input_total < output_total {
                    return Err(UtxoError::InsufficientValue);
                }
                fees = fees
                    .checked_add(input_total - output_total)
                    .filter(|total| money_range(*total))
                    .ok_or(UtxoError::ValueOutOfRange)?;
            }

            for (index, output) in tx.vout.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, index as u32);
                if self.entries.contains_key(&outpoint) {
                    return Err(UtxoError::DuplicateOutput(outpoint));
                }
                self.set_entry(
                    outpoint,
                    Some(UtxoEntry {
                        value: output.value,
                        lock: output.lock,
                        height,
                        is_coinbase: tx.is_coinbase(),
                        spent: false,
                    }),
                );
                undo.created.push(outpoint);
            }
        }
        undo.fees = fees;

        if let Some(coinbase) = block.transactions.first().filter(|tx| tx.is_coinbase()) {
            let paid = coinbase
                .total_output_value()
                .ok_or(UtxoError::ValueOutOfRange)?;
            let allowed = block_subsidy(height, params)
                .checked_add(fees)
                .ok_or(UtxoError::ValueOutOfRange)?;
            if paid > allowed {
                return Err(UtxoError::CoinbaseOverpay);
            }
        }
        Ok(())
    }

    /// Reverts the changes recorded in `undo`: spent entries get their prior
    /// state back, then created outputs are removed, both newest first.
    pub fn rollback(&mut self, undo: &UndoRecord) {
        for spent in undo.spent.iter().rev() {
            self.set_entry(spent.outpoint, Some(spent.entry.clone()));
        }
        for outpoint in undo.created.iter().rev() {
            self.set_entry(*outpoint, None);
        }
    }

    /// Writes the current state of every touched key into `batch`, one op per
    /// key, and clears the dirty set.
    pub fn flush_dirty(&mut self, batch: &mut WriteBatch) {
        let mut keys: Vec<OutPoint> = self.dirty.drain().collect();
        keys.sort_unstable();
        batch.reserve(keys.len());
        for outpoint in keys {
            match self.entries.get(&outpoint) {
                Some(entry) => batch.put(Column::Utxo, outpoint.to_key(), entry.encode()),
                None => batch.delete(Column::Utxo, outpoint.to_key()),
            }
        }
    }

    /// Forgets pending changes after a transition that was fully reverted in
    /// memory, so the set matches storage again.
    pub fn discard_dirty(&mut self) {
        self.dirty.clear();
    }

    fn set_entry(&mut self, outpoint: OutPoint, entry: Option<UtxoEntry>) {
        if let Some(new) = &entry {
            if !new.spent {
                self.credit(new.lock, new.value);
            }
        }
        let old = match entry {
            Some(new) => self.entries.insert(outpoint, new),
            None => self.entries.remove(&outpoint),
        };
        if let Some(old) = old {
            if !old.spent {
                self.debit(&old.lock, old.value);
            }
        }
        self.dirty.insert(outpoint);
    }

    fn credit(&mut self, lock: PubKeyHash, value: Amount) {
        *self.balances.entry(lock).or_insert(0) += value;
    }

    fn debit(&mut self, lock: &PubKeyHash, value: Amount) {
        if let Some(balance) = self.balances.get_mut(lock) {
            *balance -= value;
            if *balance == 0 {
                self.balances.remove(lock);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(flags: (bool, bool)) -> UtxoEntry {
        UtxoEntry {
            value: 12_345,
            lock: [7u8; 20],
            height: 42,
            is_coinbase: flags.0,
            spent: flags.1,
        }
    }

    #[test]
    fn entry_layout() {
        let bytes = entry((true, true)).encode();
        assert_eq!(bytes.len(), UTXO_ENTRY_LEN);
        assert_eq!(&bytes[0..8], &12_345i64.to_le_bytes());
        assert_eq!(&bytes[8..28], &[7u8; 20]);
        assert_eq!(&bytes[28..32], &42u32.to_le_bytes());
        assert_eq!(bytes[32], FLAG_COINBASE | FLAG_SPENT);
    }

    #[test]
    fn entry_decode_rejects_unknown_flags() {
        let mut bytes = entry((false, false)).encode();
        bytes[32] = 0x04;
        assert_eq!(
            UtxoEntry::decode(&bytes),
            Err(DecodeError::InvalidData("unknown utxo flags"))
        );
        let mut long = entry((false, true)).encode();
        long.push(0);
        assert_eq!(UtxoEntry::decode(&long), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn coinbase_maturity_window() {
        let coinbase = entry((true, false));
        assert!(!coinbase.is_mature(42, 100));
        assert!(!coinbase.is_mature(141, 100));
        assert!(coinbase.is_mature(142, 100));
        assert!(entry((false, false)).is_mature(42, 100));
    }
}
