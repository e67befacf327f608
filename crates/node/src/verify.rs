//! Worker threads that decode and prevalidate submitted blocks in parallel.
//! The chain-state engine serializes the final accept step itself.

use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use utxod_chainstate::{BlockAcceptance, ChainState, ChainStateError};
use utxod_storage::KeyValueStore;

pub type VerifyReply = Result<BlockAcceptance, ChainStateError>;

struct VerifyJob {
    bytes: Vec<u8>,
    reply: Sender<VerifyReply>,
}

pub struct VerifyPool {
    sender: Mutex<Option<Sender<VerifyJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl VerifyPool {
    pub fn start<S: KeyValueStore + 'static>(
        chain: Arc<ChainState<S>>,
        workers: usize,
        queue: usize,
    ) -> Result<Self, String> {
        let (sender, receiver) = bounded::<VerifyJob>(queue.max(1));
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let chain = Arc::clone(&chain);
            let handle = thread::Builder::new()
                .name(format!("verify-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        let result = chain.submit_block(&job.bytes);
                        let _ = job.reply.send(result);
                    }
                })
                .map_err(|err| format!("failed to spawn verify worker: {err}"))?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        })
    }

    /// Queues a serialized block. Blocks while the queue is full; the
    /// returned channel yields the engine's answer.
    pub fn submit(&self, bytes: Vec<u8>) -> Result<Receiver<VerifyReply>, String> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| "verify pool lock poisoned".to_string())?
            .clone()
            .ok_or_else(|| "verify pool is shut down".to_string())?;
        let (reply, answer) = bounded(1);
        sender
            .send(VerifyJob { bytes, reply })
            .map_err(|_| "verify workers stopped".to_string())?;
        Ok(answer)
    }

    /// Stops accepting jobs, lets queued ones finish and joins the workers.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for VerifyPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
