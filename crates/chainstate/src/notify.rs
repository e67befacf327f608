//! Tip-change callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use primitive_types::U256;
use utxod_consensus::Hash256;

use crate::index::ChainTip;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TipSnapshot {
    pub hash: Hash256,
    pub height: u32,
    pub chainwork: U256,
}

impl From<&ChainTip> for TipSnapshot {
    fn from(tip: &ChainTip) -> Self {
        Self {
            hash: tip.hash,
            height: tip.height,
            chainwork: tip.chainwork,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type TipCallback = Arc<dyn Fn(&TipSnapshot) + Send + Sync>;

#[derive(Default)]
pub struct TipListeners {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, TipCallback)>>,
    /// Sequence of the last delivered tip. Held while callbacks run.
    delivered: Mutex<u64>,
}

impl TipListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TipSnapshot) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(callback)));
        }
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Calls every listener with `tip`, the tip change numbered `sequence`.
    /// A change older than one already delivered is dropped, so listeners
    /// see tips in commit order even when writers race to notify.
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// register or unregister listeners. It must not submit blocks.
    pub fn notify(&self, sequence: u64, tip: &TipSnapshot) {
        let Ok(mut delivered) = self.delivered.lock() else {
            return;
        };
        if sequence <= *delivered {
            return;
        }
        *delivered = sequence;
        let callbacks: Vec<TipCallback> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(tip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn snapshot(height: u32) -> TipSnapshot {
        TipSnapshot {
            hash: [height as u8; 32],
            height,
            chainwork: U256::from(height),
        }
    }

    #[test]
    fn listeners_fire_until_unregistered() {
        let listeners = TipListeners::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = Arc::clone(&seen);
        let id = listeners.register(move |tip| {
            seen_cb.store(tip.height, Ordering::SeqCst);
        });

        listeners.notify(1, &snapshot(4));
        assert_eq!(seen.load(Ordering::SeqCst), 4);

        assert!(listeners.unregister(id));
        assert!(!listeners.unregister(id));
        listeners.notify(2, &snapshot(9));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn stale_tip_changes_are_dropped() {
        let listeners = TipListeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        listeners.register(move |tip| seen_cb.lock().expect("lock").push(tip.height));

        listeners.notify(2, &snapshot(7));
        listeners.notify(1, &snapshot(6));
        listeners.notify(2, &snapshot(7));
        listeners.notify(3, &snapshot(8));
        assert_eq!(*seen.lock().expect("lock"), vec![7, 8]);
    }
}
