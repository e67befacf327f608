//! Bounded buffer for blocks whose parent has not arrived yet.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use utxod_consensus::{hash256_to_hex, Hash256};

use crate::validation::PrevalidatedBlock;

struct OrphanBlock {
    block: PrevalidatedBlock,
    received: Instant,
}

pub struct OrphanPool {
    blocks: HashMap<Hash256, OrphanBlock>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
    /// Arrival order; may hold hashes already taken out of `blocks`.
    arrival: VecDeque<Hash256>,
    max_blocks: usize,
    ttl: Duration,
}

impl OrphanPool {
    pub fn new(max_blocks: usize, ttl: Duration) -> Self {
        Self {
            blocks: HashMap::new(),
            by_parent: HashMap::new(),
            arrival: VecDeque::new(),
            max_blocks,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Buffers `block`, dropping expired entries first and then the oldest
    /// ones while the pool is full. Returns the hashes that were evicted.
    pub fn insert(&mut self, block: PrevalidatedBlock, now: Instant) -> Vec<Hash256> {
        let mut evicted = self.expire(now);
        if self.max_blocks == 0 || self.blocks.contains_key(&block.hash) {
            return evicted;
        }
        while self.blocks.len() >= self.max_blocks {
            match self.pop_oldest() {
                Some(hash) => evicted.push(hash),
                None => break,
            }
        }

        let hash = block.hash;
        let parent = block.block.header.prev_block;
        self.by_parent.entry(parent).or_default().push(hash);
        self.arrival.push_back(hash);
        self.blocks.insert(
            hash,
            OrphanBlock {
                block,
                received: now,
            },
        );
        evicted
    }

    /// Removes and returns every buffered child of `parent`.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<PrevalidatedBlock> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        children
            .into_iter()
            .filter_map(|hash| self.blocks.remove(&hash))
            .map(|orphan| orphan.block)
            .collect()
    }

    /// Drops every block older than the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<Hash256> {
        let mut expired = Vec::new();
        while let Some(hash) = self.arrival.front().copied() {
            match self.blocks.get(&hash) {
                Some(orphan) if now.saturating_duration_since(orphan.received) < self.ttl => break,
                Some(_) => {
                    self.arrival.pop_front();
                    self.remove(&hash);
                    expired.push(hash);
                }
                None => {
                    self.arrival.pop_front();
                }
            }
        }
        for hash in &expired {
            utxod_log::log_debug!("orphan block {} expired", hash256_to_hex(hash));
        }
        expired
    }

    fn pop_oldest(&mut self) -> Option<Hash256> {
        while let Some(hash) = self.arrival.pop_front() {
            if self.remove(&hash) {
                utxod_log::log_debug!(
                    "orphan pool full; evicted {}",
                    hash256_to_hex(&hash)
                );
                return Some(hash);
            }
        }
        None
    }

    fn remove(&mut self, hash: &Hash256) -> bool {
        let Some(orphan) = self.blocks.remove(hash) else {
            return false;
        };
        let parent = orphan.block.block.header.prev_block;
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        true
    }
}
