//! Bulk block import from a text file: one hex-encoded block per line,
//! blank lines and `#` comments ignored.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;
use utxod_chainstate::BlockAcceptance;

use crate::parse_hex_bytes;
use crate::verify::{VerifyPool, VerifyReply};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub submitted: u64,
    pub connected: u64,
    pub side_branch: u64,
    pub duplicate: u64,
    pub orphan_pending: u64,
    pub rejected: u64,
}

impl ImportSummary {
    fn record(&mut self, acceptance: &BlockAcceptance) {
        match acceptance {
            BlockAcceptance::Connected { .. } => self.connected += 1,
            BlockAcceptance::SideBranch { .. } => self.side_branch += 1,
            BlockAcceptance::Duplicate(_) => self.duplicate += 1,
            BlockAcceptance::OrphanPending(_) => self.orphan_pending += 1,
            BlockAcceptance::Rejected(rejection) => {
                log_debug!("Import: block rejected ({rejection})");
                self.rejected += 1;
            }
        }
    }
}

/// Feeds every block in `path` through `pool`, keeping at most
/// `max_in_flight` answers outstanding. Stops early when `cancel` is set.
pub fn import_file(
    pool: &VerifyPool,
    path: &Path,
    max_in_flight: usize,
    cancel: &AtomicBool,
) -> Result<ImportSummary, String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open import file {}: {err}", path.display()))?;
    let reader = BufReader::new(file);
    let mut summary = ImportSummary::default();
    let mut pending: VecDeque<Receiver<VerifyReply>> = VecDeque::new();

    for (index, line) in reader.lines().enumerate() {
        if cancel.load(Ordering::Acquire) {
            log_info!("Import interrupted after {} blocks", summary.submitted);
            break;
        }
        let line =
            line.map_err(|err| format!("failed to read import file {}: {err}", path.display()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bytes = parse_hex_bytes(line)
            .ok_or_else(|| format!("invalid hex on line {} of {}", index + 1, path.display()))?;
        pending.push_back(pool.submit(bytes)?);
        summary.submitted += 1;
        while pending.len() > max_in_flight.max(1) {
            if let Some(answer) = pending.pop_front() {
                collect(&mut summary, answer)?;
            }
        }
    }
    while let Some(answer) = pending.pop_front() {
        collect(&mut summary, answer)?;
    }
    Ok(summary)
}

fn collect(summary: &mut ImportSummary, answer: Receiver<VerifyReply>) -> Result<(), String> {
    let acceptance = answer
        .recv()
        .map_err(|_| "verify worker dropped an import job".to_string())?
        .map_err(|err| err.to_string())?;
    summary.record(&acceptance);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    use utxod_chainstate::{ChainState, ChainStateOptions};
    use utxod_consensus::params::{consensus_params, Network};
    use utxod_storage::memory::MemoryStore;

    use crate::mempool::Mempool;
    use crate::miner::mine_block;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    fn open_chain() -> Arc<ChainState<MemoryStore>> {
        Arc::new(
            ChainState::open(
                Arc::new(MemoryStore::new()),
                consensus_params(Network::Regtest),
                ChainStateOptions::default(),
            )
            .expect("open"),
        )
    }

    #[test]
    fn imports_blocks_into_fresh_chain() {
        let source = open_chain();
        let pool = Mutex::new(Mempool::new(0));
        let mut lines = vec!["# exported chain".to_string(), String::new()];
        for _ in 0..5 {
            let (block, _) = mine_block(source.as_ref(), &pool, [2u8; 20], &AtomicBool::new(false))
                .expect("mine")
                .expect("found");
            lines.push(hex(&block.consensus_encode()));
        }
        // Out of order lines resolve through the orphan buffer.
        lines.swap(3, 4);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blocks.hex");
        let mut file = File::create(&path).expect("create");
        writeln!(file, "{}", lines.join("\n")).expect("write");

        let target = open_chain();
        let verify = VerifyPool::start(Arc::clone(&target), 1, 4).expect("start");
        let summary = import_file(&verify, &path, 8, &AtomicBool::new(false)).expect("import");
        verify.shutdown();

        assert_eq!(summary.submitted, 5);
        assert_eq!(summary.connected + summary.orphan_pending, 5);
        assert_eq!(summary.rejected, 0);
        assert_eq!(target.tip().expect("tip"), source.tip().expect("tip"));
    }

    #[test]
    fn bad_hex_reports_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.hex");
        std::fs::write(&path, "# header\nzz\n").expect("write");
        let verify = VerifyPool::start(open_chain(), 1, 1).expect("start");
        let err = import_file(&verify, &path, 1, &AtomicBool::new(false)).expect_err("bad hex");
        assert!(err.contains("line 2"), "{err}");
    }
}
