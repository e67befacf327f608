//! Chain-state engine: block acceptance, tip selection and reorganization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use primitive_types::U256;
use utxod_consensus::constants::{
    DEFAULT_MAX_ORPHAN_BLOCKS, DEFAULT_ORPHAN_TTL_SECS, MEDIAN_TIME_SPAN,
};
use utxod_consensus::money::Amount;
use utxod_consensus::{
    block_subsidy, hash256_to_hex, ChainParams, ConsensusParams, Hash256, PubKeyHash,
};
use utxod_log::{log_debug, log_error, log_info, log_warn};
use utxod_pow::difficulty::{next_work_required, retarget_window_start, HeaderInfo};
use utxod_pow::block_proof;
use utxod_primitives::block::Block;
use utxod_primitives::encoding::DecodeError;
use utxod_primitives::outpoint::OutPoint;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::genesis::build_genesis_block;
use crate::index::{
    chainwork_bytes, status_with_block, status_with_failed, status_with_undo,
    status_without_undo, ChainIndex, ChainTip, HeaderEntry,
};
use crate::notify::{ListenerId, TipListeners, TipSnapshot};
use crate::orphans::OrphanPool;
use crate::undo::UndoRecord;
use crate::utxo::{UtxoEntry, UtxoSet};
use crate::validation::{
    check_coinbase_height, check_contextual_header, median_time_past,
    prevalidate_block_with_size, PrevalidatedBlock,
};

const DEFAULT_MAX_REORG_DEPTH: u32 = 288;

/// Failures that stop the engine. Once one is returned every later call
/// answers `Halted`.
#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Corrupt(&'static str),
    Halted,
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "storage error: {err}"),
            ChainStateError::Corrupt(message) => write!(f, "corrupt chain state: {message}"),
            ChainStateError::Halted => write!(f, "chain state halted after a fatal error"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectKind {
    MalformedEncoding,
    ConsensusViolation,
    ReorgFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectKind,
    pub reason: &'static str,
}

impl Rejection {
    pub fn malformed(reason: &'static str) -> Self {
        Self {
            kind: RejectKind::MalformedEncoding,
            reason,
        }
    }

    pub fn consensus(reason: &'static str) -> Self {
        Self {
            kind: RejectKind::ConsensusViolation,
            reason,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            RejectKind::MalformedEncoding => "malformed",
            RejectKind::ConsensusViolation => "invalid",
            RejectKind::ReorgFailure => "reorg failed",
        };
        write!(f, "{kind}: {}", self.reason)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// The block is now the tip of the active chain.
    Connected { hash: Hash256, height: u32 },
    /// Stored, but its branch does not have more work than the tip.
    SideBranch { hash: Hash256, height: u32 },
    Duplicate(Hash256),
    /// Parent unknown; buffered until it arrives.
    OrphanPending(Hash256),
    Rejected(Rejection),
}

impl BlockAcceptance {
    pub fn is_rejected(&self) -> bool {
        matches!(self, BlockAcceptance::Rejected(_))
    }
}

#[derive(Clone, Debug)]
pub struct ChainStateOptions {
    pub max_reorg_depth: u32,
    pub max_orphan_blocks: usize,
    pub orphan_ttl: Duration,
}

impl ChainStateOptions {
    pub fn from_chain_params(params: &ChainParams) -> Self {
        Self {
            max_reorg_depth: params.max_reorg_depth,
            max_orphan_blocks: params.max_orphan_blocks,
            orphan_ttl: Duration::from_secs(params.orphan_ttl_secs),
        }
    }
}

impl Default for ChainStateOptions {
    fn default() -> Self {
        Self {
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            max_orphan_blocks: DEFAULT_MAX_ORPHAN_BLOCKS,
            orphan_ttl: Duration::from_secs(DEFAULT_ORPHAN_TTL_SECS),
        }
    }
}

/// What a block building on the current tip has to satisfy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateContext {
    pub prev_hash: Hash256,
    pub height: u32,
    pub bits: u32,
    /// Earliest acceptable timestamp (median time past + 1).
    pub min_time: u32,
    pub subsidy: Amount,
}

struct EngineState {
    tip: ChainTip,
    /// Bumped on every tip change; orders listener delivery.
    tip_sequence: u64,
    utxos: UtxoSet,
    orphans: OrphanPool,
}

struct DisconnectedBlock {
    hash: Hash256,
    entry: HeaderEntry,
    block: Block,
}

struct ConnectedBlock {
    hash: Hash256,
    entry: HeaderEntry,
    undo: UndoRecord,
}

pub struct ChainState<S> {
    index: ChainIndex<S>,
    params: ConsensusParams,
    options: ChainStateOptions,
    state: RwLock<EngineState>,
    listeners: TipListeners,
    halted: AtomicBool,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Loads the persisted tip and UTXO snapshot, or connects the genesis
    /// block when the store is empty. Finishes an interrupted reindex and
    /// activates any stored block that has more work than the tip.
    pub fn open(
        store: Arc<S>,
        params: ConsensusParams,
        options: ChainStateOptions,
    ) -> Result<Self, ChainStateError> {
        let index = ChainIndex::new(store);
        let genesis = build_genesis_block(&params);
        let genesis_hash = genesis.hash();

        let (tip, utxos) = match index.get_tip()? {
            Some(tip) => {
                if index.height_hash(0)? != Some(genesis_hash) {
                    return Err(ChainStateError::Corrupt(
                        "stored genesis does not match network",
                    ));
                }
                if index.height_hash(tip.height)? != Some(tip.hash) {
                    return Err(ChainStateError::Corrupt("tip missing from height index"));
                }
                let utxos = UtxoSet::load(index.store().as_ref())?;
                log_info!(
                    "Loaded chain state at height {} ({}), {} utxo entries",
                    tip.height,
                    hash256_to_hex(&tip.hash),
                    utxos.len()
                );
                (tip, utxos)
            }
            None => {
                let connected = connect_genesis(&index, &genesis, &params)?;
                log_info!("Inserted genesis block {}", hash256_to_hex(&genesis_hash));
                connected
            }
        };

        let orphans = OrphanPool::new(options.max_orphan_blocks, options.orphan_ttl);
        let chain = Self {
            index,
            params,
            options,
            state: RwLock::new(EngineState {
                tip,
                tip_sequence: 0,
                utxos,
                orphans,
            }),
            listeners: TipListeners::new(),
            halted: AtomicBool::new(false),
        };
        if chain.index.reindex_pending()? {
            log_warn!("Previous UTXO reindex did not finish; replaying the active chain");
            chain.reindex_utxos()?;
        }
        chain.activate_best_stored()?;
        Ok(chain)
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn tip(&self) -> Result<TipSnapshot, ChainStateError> {
        let state = self.read_state()?;
        Ok(TipSnapshot::from(&state.tip))
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        let state = self.read_state()?;
        Ok(state.utxos.get(outpoint).cloned())
    }

    pub fn balance(&self, lock: &PubKeyHash) -> Result<Amount, ChainStateError> {
        let state = self.read_state()?;
        Ok(state.utxos.balance(lock))
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let _state = self.read_state()?;
        self.guard(self.index.get_block(hash))
    }

    pub fn header_entry(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, ChainStateError> {
        let _state = self.read_state()?;
        self.guard(self.index.get_header(hash))
    }

    pub fn hash_at_height(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        let state = self.read_state()?;
        if height > state.tip.height {
            return Ok(None);
        }
        self.guard(self.index.height_hash(height))
    }

    pub fn orphan_count(&self) -> Result<usize, ChainStateError> {
        Ok(self.read_state()?.orphans.len())
    }

    /// Runs `f` against the UTXO set and the tip it belongs to, under one
    /// read guard.
    pub fn with_utxos<R>(
        &self,
        f: impl FnOnce(&UtxoSet, &TipSnapshot) -> R,
    ) -> Result<R, ChainStateError> {
        let state = self.read_state()?;
        Ok(f(&state.utxos, &TipSnapshot::from(&state.tip)))
    }

    pub fn template_context(&self) -> Result<TemplateContext, ChainStateError> {
        let state = self.read_state()?;
        let tip = state.tip;
        let result = self.template_context_for(&tip);
        self.guard(result)
    }

    fn template_context_for(&self, tip: &ChainTip) -> Result<TemplateContext, ChainStateError> {
        let parent = self.require_header(&tip.hash)?;
        let height = tip.height + 1;
        let (bits, mtp) = self.child_requirements(&tip.hash, &parent, height)?;
        Ok(TemplateContext {
            prev_hash: tip.hash,
            height,
            bits,
            min_time: mtp.saturating_add(1),
            subsidy: block_subsidy(height, &self.params),
        })
    }

    pub fn on_new_tip<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TipSnapshot) + Send + Sync + 'static,
    {
        self.listeners.register(callback)
    }

    pub fn remove_tip_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Decodes and validates a serialized block and offers it to the chain.
    pub fn submit_block(&self, bytes: &[u8]) -> Result<BlockAcceptance, ChainStateError> {
        self.ensure_live()?;
        let block = match Block::consensus_decode(bytes) {
            Ok(block) => block,
            Err(err) => {
                log_debug!("Rejecting undecodable block ({} bytes): {err}", bytes.len());
                return Ok(BlockAcceptance::Rejected(Rejection::malformed(
                    decode_reason(&err),
                )));
            }
        };

        let hash = block.hash();
        if let Some(known) = self.known_block(&hash)? {
            return Ok(known);
        }

        match prevalidate_block_with_size(block, Some(bytes.len()), &self.params) {
            Ok(prevalidated) => self.accept_prevalidated(prevalidated),
            Err(err) => {
                log_debug!("Block {} failed validation: {err}", hash256_to_hex(&hash));
                Ok(BlockAcceptance::Rejected(Rejection::consensus(err.reason())))
            }
        }
    }

    /// Offers a block that already passed `prevalidate_block` to the chain.
    /// Tip listeners run after the engine lock is released.
    pub fn accept_prevalidated(
        &self,
        block: PrevalidatedBlock,
    ) -> Result<BlockAcceptance, ChainStateError> {
        let (acceptance, new_tip) = {
            let mut state = self.write_state()?;
            let before = state.tip.hash;
            let acceptance = self.guard(self.accept_locked(&mut state, block))?;
            let new_tip = (state.tip.hash != before).then(|| {
                state.tip_sequence += 1;
                (state.tip_sequence, TipSnapshot::from(&state.tip))
            });
            (acceptance, new_tip)
        };
        if let Some((sequence, tip)) = new_tip {
            self.listeners.notify(sequence, &tip);
        }
        Ok(acceptance)
    }

    /// Clears the UTXO and undo keyspaces and replays the active chain from
    /// genesis out of the stored blocks. A marker in the meta column covers
    /// the replay; `open` restarts an interrupted one.
    pub fn reindex_utxos(&self) -> Result<(), ChainStateError> {
        let mut state = self.write_state()?;
        let result = self.reindex_locked(&mut state);
        self.guard(result)
    }

    /// Connects a stored block whose branch has more work than the tip.
    /// Such a block exists when the process stopped between storing it and
    /// committing its activation.
    fn activate_best_stored(&self) -> Result<(), ChainStateError> {
        let mut state = self.write_state()?;
        let result = self.activate_best_stored_locked(&mut state);
        self.guard(result)
    }

    fn activate_best_stored_locked(&self, state: &mut EngineState) -> Result<(), ChainStateError> {
        while let Some((hash, entry)) = self.index.best_stored_above(&state.tip.chainwork)? {
            let block = self
                .index
                .get_block(&hash)?
                .ok_or(ChainStateError::Corrupt("missing stored block"))?;
            let prevalidated = PrevalidatedBlock {
                hash,
                txids: block.txids(),
                size: block.consensus_encode().len(),
                block,
            };
            match self.activate(state, hash, entry, prevalidated)? {
                BlockAcceptance::Connected { height, .. } => {
                    log_info!(
                        "Activated stored block {} at height {height}",
                        hash256_to_hex(&hash)
                    );
                    return Ok(());
                }
                BlockAcceptance::Rejected(rejection) => {
                    log_warn!(
                        "Stored block {} could not be activated: {rejection}",
                        hash256_to_hex(&hash)
                    );
                }
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    fn known_block(&self, hash: &Hash256) -> Result<Option<BlockAcceptance>, ChainStateError> {
        let state = self.read_state()?;
        if state.orphans.contains(hash) {
            return Ok(Some(BlockAcceptance::OrphanPending(*hash)));
        }
        let entry = self.guard(self.index.get_header(hash))?;
        Ok(entry.map(|entry| known_acceptance(hash, &entry)))
    }

    fn accept_locked(
        &self,
        state: &mut EngineState,
        block: PrevalidatedBlock,
    ) -> Result<BlockAcceptance, ChainStateError> {
        let now = Instant::now();
        let acceptance = self.accept_one(state, block, now)?;
        if let BlockAcceptance::Connected { hash, .. } | BlockAcceptance::SideBranch { hash, .. } =
            acceptance
        {
            self.resolve_orphans(state, hash, now)?;
        }
        Ok(acceptance)
    }

    fn resolve_orphans(
        &self,
        state: &mut EngineState,
        parent: Hash256,
        now: Instant,
    ) -> Result<(), ChainStateError> {
        let mut parents = vec![parent];
        while let Some(parent) = parents.pop() {
            for child in state.orphans.take_children(&parent) {
                let child_hash = child.hash;
                match self.accept_one(state, child, now)? {
                    BlockAcceptance::Connected { .. } | BlockAcceptance::SideBranch { .. } => {
                        parents.push(child_hash);
                    }
                    other => log_debug!(
                        "Orphan {} not accepted: {other:?}",
                        hash256_to_hex(&child_hash)
                    ),
                }
            }
        }
        Ok(())
    }

    fn accept_one(
        &self,
        state: &mut EngineState,
        block: PrevalidatedBlock,
        now: Instant,
    ) -> Result<BlockAcceptance, ChainStateError> {
        let hash = block.hash;
        if let Some(entry) = self.index.get_header(&hash)? {
            return Ok(known_acceptance(&hash, &entry));
        }
        if state.orphans.contains(&hash) {
            return Ok(BlockAcceptance::OrphanPending(hash));
        }

        let parent_hash = block.block.header.prev_block;
        let Some(parent) = self.index.get_header(&parent_hash)? else {
            log_debug!(
                "Buffering orphan block {} (parent {} unknown)",
                hash256_to_hex(&hash),
                hash256_to_hex(&parent_hash)
            );
            state.orphans.insert(block, now);
            return Ok(BlockAcceptance::OrphanPending(hash));
        };
        if parent.is_failed() {
            return Ok(BlockAcceptance::Rejected(Rejection::consensus(
                "parent block is invalid",
            )));
        }

        let height = parent
            .height
            .checked_add(1)
            .ok_or(ChainStateError::Corrupt("block height overflow"))?;
        let (expected_bits, mtp) = self.child_requirements(&parent_hash, &parent, height)?;
        let contextual = check_contextual_header(&block.block.header, expected_bits, mtp, unix_now())
            .and_then(|()| check_coinbase_height(&block.block, height));
        if let Err(err) = contextual {
            log_debug!("Block {} rejected: {err}", hash256_to_hex(&hash));
            return Ok(BlockAcceptance::Rejected(Rejection::consensus(err.reason())));
        }

        let proof = match block_proof(block.block.header.bits) {
            Ok(proof) => proof,
            Err(_) => {
                return Ok(BlockAcceptance::Rejected(Rejection::consensus(
                    "invalid compact target",
                )))
            }
        };
        let chainwork = parent.chainwork_value().saturating_add(proof);
        let entry = HeaderEntry {
            prev_hash: parent_hash,
            height,
            time: block.block.header.time,
            bits: block.block.header.bits,
            chainwork: chainwork_bytes(&chainwork),
            status: status_with_block(0),
        };
        let mut batch = WriteBatch::new();
        self.index.put_block(&mut batch, &hash, &block.block);
        self.index.put_header(&mut batch, &hash, &entry);
        self.index.commit(&batch)?;

        if chainwork <= state.tip.chainwork {
            log_debug!(
                "Stored side-branch block {} at height {height}",
                hash256_to_hex(&hash)
            );
            return Ok(BlockAcceptance::SideBranch { hash, height });
        }
        self.activate(state, hash, entry, block)
    }

    /// Makes `hash` the tip: rolls the active chain back to the fork point
    /// and connects the new branch. All UTXO work happens in memory; storage
    /// sees one batch, and only if the whole transition succeeded.
    fn activate(
        &self,
        state: &mut EngineState,
        hash: Hash256,
        entry: HeaderEntry,
        block: PrevalidatedBlock,
    ) -> Result<BlockAcceptance, ChainStateError> {
        let new_height = entry.height;
        let new_work = entry.chainwork_value();

        let mut branch: Vec<(Hash256, HeaderEntry)> = Vec::new();
        let mut cursor_hash = hash;
        let mut cursor = entry;
        while !self.on_active_chain(&state.tip, &cursor_hash, &cursor)? {
            let prev_hash = cursor.prev_hash;
            branch.push((cursor_hash, cursor));
            cursor = self.require_header(&prev_hash)?;
            cursor_hash = prev_hash;
        }
        branch.reverse();
        let fork_height = cursor.height;

        let depth = state.tip.height - fork_height;
        if depth > self.options.max_reorg_depth {
            log_warn!(
                "Not reorganizing to {}: fork at height {fork_height} is {depth} blocks deep (limit {})",
                hash256_to_hex(&hash),
                self.options.max_reorg_depth
            );
            return Ok(BlockAcceptance::SideBranch {
                hash,
                height: new_height,
            });
        }
        if let Some(first_bad) = branch.iter().position(|(_, entry)| entry.is_failed()) {
            let mut batch = WriteBatch::new();
            for (bad_hash, bad_entry) in &branch[first_bad + 1..] {
                let mut marked = bad_entry.clone();
                marked.status = status_with_failed(marked.status);
                self.index.put_header(&mut batch, bad_hash, &marked);
            }
            self.index.commit(&batch)?;
            return Ok(BlockAcceptance::Rejected(Rejection::consensus(
                "branch contains an invalid block",
            )));
        }

        let mut disconnected: Vec<DisconnectedBlock> = Vec::with_capacity(depth as usize);
        for height in (fork_height + 1..=state.tip.height).rev() {
            let old_hash = self
                .index
                .height_hash(height)?
                .ok_or(ChainStateError::Corrupt("missing height index entry"))?;
            let old_entry = self.require_header(&old_hash)?;
            let undo = self
                .index
                .get_undo(&old_hash)?
                .ok_or(ChainStateError::Corrupt("missing undo record"))?;
            let old_block = self
                .index
                .get_block(&old_hash)?
                .ok_or(ChainStateError::Corrupt("missing stored block"))?;
            state.utxos.rollback(&undo);
            disconnected.push(DisconnectedBlock {
                hash: old_hash,
                entry: old_entry,
                block: old_block,
            });
        }

        let mut submitted = Some(block);
        let mut connected: Vec<ConnectedBlock> = Vec::with_capacity(branch.len());
        let mut failure = None;
        for (position, (branch_hash, branch_entry)) in branch.iter().enumerate() {
            let from_submitted = match submitted.take() {
                Some(pre) if pre.hash == *branch_hash => Some(pre),
                other => {
                    submitted = other;
                    None
                }
            };
            let (branch_block, txids) = match from_submitted {
                Some(pre) => (pre.block, pre.txids),
                None => {
                    let stored = self
                        .index
                        .get_block(branch_hash)?
                        .ok_or(ChainStateError::Corrupt("missing stored block"))?;
                    let txids = stored.txids();
                    (stored, txids)
                }
            };
            match state
                .utxos
                .apply(&branch_block, &txids, branch_entry.height, &self.params)
            {
                Ok(undo) => connected.push(ConnectedBlock {
                    hash: *branch_hash,
                    entry: branch_entry.clone(),
                    undo,
                }),
                Err(err) => {
                    failure = Some((position, err));
                    break;
                }
            }
        }

        if let Some((position, err)) = failure {
            for block in connected.iter().rev() {
                state.utxos.rollback(&block.undo);
            }
            for old in disconnected.iter().rev() {
                let txids = old.block.txids();
                state
                    .utxos
                    .apply(&old.block, &txids, old.entry.height, &self.params)
                    .map_err(|_| ChainStateError::Corrupt("old branch failed to reconnect"))?;
            }
            state.utxos.discard_dirty();

            let mut batch = WriteBatch::new();
            for (bad_hash, bad_entry) in &branch[position..] {
                let mut marked = bad_entry.clone();
                marked.status = status_with_failed(marked.status);
                self.index.put_header(&mut batch, bad_hash, &marked);
            }
            self.index.commit(&batch)?;

            let failed_hash = hash256_to_hex(&branch[position].0);
            if disconnected.is_empty() {
                log_debug!("Block {failed_hash} failed to connect: {err}");
                return Ok(BlockAcceptance::Rejected(Rejection::consensus(err.reason())));
            }
            log_error!(
                "Reorg to {} failed at block {failed_hash}: {err}; kept tip {}",
                hash256_to_hex(&hash),
                hash256_to_hex(&state.tip.hash)
            );
            return Ok(BlockAcceptance::Rejected(Rejection {
                kind: RejectKind::ReorgFailure,
                reason: err.reason(),
            }));
        }

        let new_tip = ChainTip {
            hash,
            height: new_height,
            chainwork: new_work,
        };
        let mut batch = WriteBatch::new();
        for old in &disconnected {
            self.index.delete_undo(&mut batch, &old.hash);
            let mut entry = old.entry.clone();
            entry.status = status_without_undo(entry.status);
            self.index.put_header(&mut batch, &old.hash, &entry);
            if old.entry.height > new_height {
                self.index.clear_height_hash(&mut batch, old.entry.height);
            }
        }
        for block in &connected {
            self.index.put_undo(&mut batch, &block.hash, &block.undo);
            let mut entry = block.entry.clone();
            entry.status = status_with_undo(entry.status);
            self.index.put_header(&mut batch, &block.hash, &entry);
            self.index
                .set_height_hash(&mut batch, block.entry.height, &block.hash);
        }
        state.utxos.flush_dirty(&mut batch);
        self.index.set_tip(&mut batch, &new_tip);
        self.index.commit(&batch)?;

        let old_tip = std::mem::replace(&mut state.tip, new_tip);
        if disconnected.is_empty() {
            log_debug!(
                "Connected block {} at height {new_height}",
                hash256_to_hex(&hash)
            );
        } else {
            log_info!(
                "Reorganized: disconnected {} blocks from {} (height {}), connected {} to {} (height {new_height})",
                disconnected.len(),
                hash256_to_hex(&old_tip.hash),
                old_tip.height,
                connected.len(),
                hash256_to_hex(&hash)
            );
        }
        Ok(BlockAcceptance::Connected {
            hash,
            height: new_height,
        })
    }

    fn reindex_locked(&self, state: &mut EngineState) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        self.index.clear_column(&mut batch, Column::Utxo)?;
        self.index.clear_column(&mut batch, Column::BlockUndo)?;
        self.index.set_reindex_marker(&mut batch);
        self.index.commit(&batch)?;
        state.utxos = UtxoSet::new();

        let tip_height = state.tip.height;
        for height in 0..=tip_height {
            let hash = self
                .index
                .height_hash(height)?
                .ok_or(ChainStateError::Corrupt("missing height index entry"))?;
            let block = self
                .index
                .get_block(&hash)?
                .ok_or(ChainStateError::Corrupt("missing stored block"))?;
            let mut entry = self.require_header(&hash)?;
            let txids = block.txids();
            let undo = state
                .utxos
                .apply(&block, &txids, height, &self.params)
                .map_err(|err| {
                    log_error!("Reindex failed at height {height}: {err}");
                    ChainStateError::Corrupt("active chain block failed to reconnect")
                })?;

            let mut batch = WriteBatch::new();
            state.utxos.flush_dirty(&mut batch);
            self.index.put_undo(&mut batch, &hash, &undo);
            entry.status = status_with_undo(entry.status);
            self.index.put_header(&mut batch, &hash, &entry);
            if height == tip_height {
                self.index.clear_reindex_marker(&mut batch);
            }
            self.index.commit(&batch)?;

            if height > 0 && height % 10_000 == 0 {
                log_info!("Reindex progress: height {height}/{tip_height}");
            }
        }
        log_info!(
            "Reindexed UTXO set through height {tip_height}, {} entries",
            state.utxos.len()
        );
        Ok(())
    }

    /// Required bits and median time past for a child of `parent` at `height`.
    fn child_requirements(
        &self,
        parent_hash: &Hash256,
        parent: &HeaderEntry,
        height: u32,
    ) -> Result<(u32, u32), ChainStateError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = parent.clone();
        loop {
            times.push(current.time);
            if times.len() == MEDIAN_TIME_SPAN || current.height == 0 {
                break;
            }
            current = self.require_header(&current.prev_hash)?;
        }
        let mtp = median_time_past(&times);

        let window_start_time = match retarget_window_start(height, &self.params) {
            Some(start) => Some(self.ancestor(parent_hash, parent, start)?.time),
            None => None,
        };
        let last = HeaderInfo {
            height: parent.height,
            time: parent.time,
            bits: parent.bits,
        };
        let bits = next_work_required(&last, window_start_time, &self.params)
            .map_err(|_| ChainStateError::Corrupt("stored header has invalid bits"))?;
        Ok((bits, mtp))
    }

    /// Header of the ancestor of `hash` at `height`, using the height index
    /// once the walk reaches the active chain.
    fn ancestor(
        &self,
        hash: &Hash256,
        entry: &HeaderEntry,
        height: u32,
    ) -> Result<HeaderEntry, ChainStateError> {
        let mut hash = *hash;
        let mut entry = entry.clone();
        while entry.height > height {
            if self.index.height_hash(entry.height)? == Some(hash) {
                let ancestor = self
                    .index
                    .height_hash(height)?
                    .ok_or(ChainStateError::Corrupt("missing height index entry"))?;
                return self.require_header(&ancestor);
            }
            hash = entry.prev_hash;
            entry = self.require_header(&hash)?;
        }
        Ok(entry)
    }

    fn on_active_chain(
        &self,
        tip: &ChainTip,
        hash: &Hash256,
        entry: &HeaderEntry,
    ) -> Result<bool, ChainStateError> {
        if entry.height > tip.height {
            return Ok(false);
        }
        Ok(self.index.height_hash(entry.height)? == Some(*hash))
    }

    fn require_header(&self, hash: &Hash256) -> Result<HeaderEntry, ChainStateError> {
        self.index
            .get_header(hash)?
            .ok_or(ChainStateError::Corrupt("missing header index entry"))
    }

    fn ensure_live(&self) -> Result<(), ChainStateError> {
        if self.is_halted() {
            return Err(ChainStateError::Halted);
        }
        Ok(())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, EngineState>, ChainStateError> {
        self.ensure_live()?;
        self.state
            .read()
            .map_err(|_| self.halt_with(ChainStateError::Corrupt("chain state lock poisoned")))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, EngineState>, ChainStateError> {
        self.ensure_live()?;
        self.state
            .write()
            .map_err(|_| self.halt_with(ChainStateError::Corrupt("chain state lock poisoned")))
    }

    fn guard<T>(&self, result: Result<T, ChainStateError>) -> Result<T, ChainStateError> {
        result.map_err(|err| self.halt_with(err))
    }

    fn halt_with(&self, err: ChainStateError) -> ChainStateError {
        if !matches!(err, ChainStateError::Halted) && !self.halted.swap(true, Ordering::AcqRel) {
            log_error!("Chain state halted: {err}");
        }
        err
    }
}

fn connect_genesis<S: KeyValueStore>(
    index: &ChainIndex<S>,
    genesis: &Block,
    params: &ConsensusParams,
) -> Result<(ChainTip, UtxoSet), ChainStateError> {
    let hash = genesis.hash();
    let txids = genesis.txids();
    let mut utxos = UtxoSet::new();
    let undo = utxos
        .apply(genesis, &txids, 0, params)
        .map_err(|_| ChainStateError::Corrupt("genesis block does not apply"))?;
    let chainwork: U256 = block_proof(genesis.header.bits)
        .map_err(|_| ChainStateError::Corrupt("invalid genesis bits"))?;
    let entry = HeaderEntry {
        prev_hash: [0u8; 32],
        height: 0,
        time: genesis.header.time,
        bits: genesis.header.bits,
        chainwork: chainwork_bytes(&chainwork),
        status: status_with_undo(status_with_block(0)),
    };
    let tip = ChainTip {
        hash,
        height: 0,
        chainwork,
    };

    let mut batch = WriteBatch::new();
    index.put_block(&mut batch, &hash, genesis);
    index.put_header(&mut batch, &hash, &entry);
    index.put_undo(&mut batch, &hash, &undo);
    index.set_height_hash(&mut batch, 0, &hash);
    utxos.flush_dirty(&mut batch);
    index.set_tip(&mut batch, &tip);
    index.commit(&batch)?;
    Ok((tip, utxos))
}

fn known_acceptance(hash: &Hash256, entry: &HeaderEntry) -> BlockAcceptance {
    if entry.is_failed() {
        BlockAcceptance::Rejected(Rejection::consensus("block previously marked invalid"))
    } else {
        BlockAcceptance::Duplicate(*hash)
    }
}

fn decode_reason(err: &DecodeError) -> &'static str {
    match err {
        DecodeError::UnexpectedEof => "unexpected end of block data",
        DecodeError::NonCanonicalVarInt => "non-canonical compact size",
        DecodeError::SizeTooLarge => "compact size too large",
        DecodeError::InvalidData(message) => *message,
        DecodeError::TrailingBytes => "trailing bytes after block",
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
