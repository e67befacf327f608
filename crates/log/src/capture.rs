use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::Level;

#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub msg: String,
}

static CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub(crate) fn is_enabled() -> bool {
    CAPTURE_ENABLED.load(Ordering::Relaxed)
}

/// Keeps the most recent `capacity` records in memory. Zero disables capture.
pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        disable_capture();
        return;
    }
    CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(4096))));
    CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_capture() {
    CAPTURE_ENABLED.store(false, Ordering::Relaxed);
}

pub fn clear_captured_logs() {
    let Some(buf) = CAPTURE.get() else {
        return;
    };
    if let Ok(mut guard) = buf.lock() {
        guard.clear();
    }
}

/// Returns up to `limit` of the newest captured records, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(buf) = CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = buf.lock() else {
        return Vec::new();
    };
    let start = guard.len().saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub(crate) fn push(record: CapturedLog) {
    let Some(buf) = CAPTURE.get() else {
        return;
    };
    let Ok(mut guard) = buf.lock() else {
        return;
    };
    let cap = CAPTURE_CAPACITY.load(Ordering::Relaxed);
    if cap == 0 {
        return;
    }
    guard.push_back(record);
    while guard.len() > cap {
        let _ = guard.pop_front();
    }
}
