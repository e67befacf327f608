//! Persisted chain layout: blocks, header index, height index, undo records
//! and the tip pointer.

use std::sync::Arc;

use primitive_types::U256;
use utxod_consensus::Hash256;
use utxod_primitives::block::Block;
use utxod_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxod_storage::{Column, KeyValueStore, WriteBatch};

use crate::state::ChainStateError;
use crate::undo::UndoRecord;

const META_TIP_KEY: &[u8] = b"tip";
/// Present while a UTXO reindex is between its first and last batch.
const META_REINDEX_KEY: &[u8] = b"reindex";

const STATUS_HAS_BLOCK: u8 = 1 << 0;
const STATUS_HAS_UNDO: u8 = 1 << 1;
const STATUS_FAILED: u8 = 1 << 2;

pub const HEADER_ENTRY_LEN: usize = 32 + 4 + 4 + 4 + 32 + 1;
pub const CHAIN_TIP_LEN: usize = 32 + 32 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderEntry {
    pub prev_hash: Hash256,
    pub height: u32,
    pub time: u32,
    pub bits: u32,
    /// Cumulative work up to and including this block, big-endian.
    pub chainwork: [u8; 32],
    pub status: u8,
}

impl HeaderEntry {
    pub fn has_block(&self) -> bool {
        has_block(self.status)
    }

    pub fn has_undo(&self) -> bool {
        has_undo(self.status)
    }

    pub fn is_failed(&self) -> bool {
        is_failed(self.status)
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_ENTRY_LEN);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_bytes(&self.chainwork);
        encoder.write_u8(self.status);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let prev_hash = decoder.read_hash_le()?;
        let height = decoder.read_u32_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let chainwork = decoder.read_fixed::<32>()?;
        let status = decoder.read_u8()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            prev_hash,
            height,
            time,
            bits,
            chainwork,
            status,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u32,
    pub chainwork: U256,
}

impl ChainTip {
    pub fn encode(&self) -> [u8; CHAIN_TIP_LEN] {
        let mut out = [0u8; CHAIN_TIP_LEN];
        out[0..32].copy_from_slice(&self.hash);
        out[32..64].copy_from_slice(&chainwork_bytes(&self.chainwork));
        out[64..68].copy_from_slice(&self.height.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != CHAIN_TIP_LEN {
            return Err(DecodeError::InvalidData("invalid tip length"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[0..32]);
        let chainwork = U256::from_big_endian(&bytes[32..64]);
        let height = u32::from_le_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]);
        Ok(Self {
            hash,
            height,
            chainwork,
        })
    }
}

pub fn chainwork_bytes(value: &U256) -> [u8; 32] {
    value.to_big_endian()
}

/// Big-endian so that a key scan walks the chain in height order.
pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub struct ChainIndex<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, ChainStateError> {
        match self.store.get(Column::HeaderIndex, hash)? {
            Some(bytes) => HeaderEntry::decode(&bytes)
                .map(Some)
                .map_err(|_| ChainStateError::Corrupt("invalid header index entry")),
            None => Ok(None),
        }
    }

    pub fn put_header(&self, batch: &mut WriteBatch, hash: &Hash256, entry: &HeaderEntry) {
        batch.put(Column::HeaderIndex, hash, entry.encode());
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => Block::consensus_decode(&bytes)
                .map(Some)
                .map_err(|_| ChainStateError::Corrupt("invalid stored block")),
            None => Ok(None),
        }
    }

    pub fn put_block(&self, batch: &mut WriteBatch, hash: &Hash256, block: &Block) {
        batch.put(Column::Block, hash, block.consensus_encode());
    }

    pub fn get_undo(&self, hash: &Hash256) -> Result<Option<UndoRecord>, ChainStateError> {
        match self.store.get(Column::BlockUndo, hash)? {
            Some(bytes) => UndoRecord::decode(&bytes)
                .map(Some)
                .map_err(|_| ChainStateError::Corrupt("invalid block undo record")),
            None => Ok(None),
        }
    }

    pub fn put_undo(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &UndoRecord) {
        batch.put(Column::BlockUndo, hash, undo.encode());
    }

    pub fn delete_undo(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.delete(Column::BlockUndo, hash);
    }

    pub fn get_tip(&self) -> Result<Option<ChainTip>, ChainStateError> {
        match self.store.get(Column::Meta, META_TIP_KEY)? {
            Some(bytes) => ChainTip::decode(&bytes)
                .map(Some)
                .map_err(|_| ChainStateError::Corrupt("invalid tip record")),
            None => Ok(None),
        }
    }

    pub fn set_tip(&self, batch: &mut WriteBatch, tip: &ChainTip) {
        batch.put(Column::Meta, META_TIP_KEY, tip.encode());
    }

    pub fn reindex_pending(&self) -> Result<bool, ChainStateError> {
        Ok(self.store.get(Column::Meta, META_REINDEX_KEY)?.is_some())
    }

    pub fn set_reindex_marker(&self, batch: &mut WriteBatch) {
        batch.put(Column::Meta, META_REINDEX_KEY, [1u8]);
    }

    pub fn clear_reindex_marker(&self, batch: &mut WriteBatch) {
        batch.delete(Column::Meta, META_REINDEX_KEY);
    }

    /// Stored, not failed header with the most work above `floor`. Ties go
    /// to the lowest hash so the choice does not depend on scan order.
    pub fn best_stored_above(
        &self,
        floor: &U256,
    ) -> Result<Option<(Hash256, HeaderEntry)>, ChainStateError> {
        let mut best: Option<(Hash256, HeaderEntry)> = None;
        let mut corrupt = false;
        self.store
            .for_each_prefix(Column::HeaderIndex, &[], &mut |key: &[u8], value: &[u8]| {
                let (Some(hash), Ok(entry)) = (decode_hash(key), HeaderEntry::decode(value))
                else {
                    corrupt = true;
                    return Ok(());
                };
                if !entry.has_block() || entry.is_failed() {
                    return Ok(());
                }
                let work = entry.chainwork_value();
                if work <= *floor {
                    return Ok(());
                }
                let better = match &best {
                    Some((best_hash, best_entry)) => {
                        let best_work = best_entry.chainwork_value();
                        work > best_work || (work == best_work && hash < *best_hash)
                    }
                    None => true,
                };
                if better {
                    best = Some((hash, entry));
                }
                Ok(())
            })?;
        if corrupt {
            return Err(ChainStateError::Corrupt("invalid header index entry"));
        }
        Ok(best)
    }

    pub fn height_hash(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => decode_hash(&bytes)
                .map(Some)
                .ok_or(ChainStateError::Corrupt("invalid height index entry")),
            None => Ok(None),
        }
    }

    pub fn set_height_hash(&self, batch: &mut WriteBatch, height: u32, hash: &Hash256) {
        batch.put(Column::HeightIndex, height_key(height), *hash);
    }

    pub fn clear_height_hash(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::HeightIndex, height_key(height));
    }

    /// Queues deletes for every key in `column`.
    pub fn clear_column(&self, batch: &mut WriteBatch, column: Column) -> Result<(), ChainStateError> {
        self.store
            .for_each_prefix(column, &[], &mut |key: &[u8], _: &[u8]| {
                batch.delete(column, key);
                Ok(())
            })?;
        Ok(())
    }

    pub fn commit(&self, batch: &WriteBatch) -> Result<(), ChainStateError> {
        self.store.write_batch(batch)?;
        Ok(())
    }
}

fn decode_hash(bytes: &[u8]) -> Option<Hash256> {
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    Some(hash)
}

pub fn status_with_block(status: u8) -> u8 {
    status | STATUS_HAS_BLOCK
}

pub fn status_with_undo(status: u8) -> u8 {
    status | STATUS_HAS_UNDO
}

pub fn status_without_undo(status: u8) -> u8 {
    status & !STATUS_HAS_UNDO
}

pub fn status_with_failed(status: u8) -> u8 {
    status | STATUS_FAILED
}

pub fn has_block(status: u8) -> bool {
    (status & STATUS_HAS_BLOCK) != 0
}

pub fn has_undo(status: u8) -> bool {
    (status & STATUS_HAS_UNDO) != 0
}

pub fn is_failed(status: u8) -> bool {
    (status & STATUS_FAILED) != 0
}
