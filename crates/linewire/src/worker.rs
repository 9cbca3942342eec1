//! A minimal stand-in for the per-worker event loop the real framework supplies.
//!
//! Each worker is one OS thread draining a channel of boxed jobs in order. `Line`s are pinned to
//! one worker (`Wid`); posting a job to a worker with [`WorkerPool::post`] is the only way
//! another thread is allowed to touch that line's tunnel state, and it always runs to completion
//! before the next job on that worker starts — there is no intra-line reordering.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

/// Worker identifier. Small on purpose: the real framework sizes this to the CPU count.
pub type Wid = u16;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads, each with its own FIFO job queue.
pub struct WorkerPool {
    senders: Vec<Sender<Job>>,
    handles: Vec<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `count` worker threads, each running its event loop immediately.
    pub fn new(count: u16) -> Self {
        assert!(count > 0, "a worker pool needs at least one worker");

        let mut senders = Vec::with_capacity(count as usize);
        let mut handles = Vec::with_capacity(count as usize);

        for wid in 0..count {
            let (tx, rx): (Sender<Job>, Receiver<Job>) = channel();
            let handle = std::thread::Builder::new()
                .name(format!("linewire-worker-{wid}"))
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");

            senders.push(tx);
            handles.push(Some(handle));
        }

        Self { senders, handles }
    }

    pub fn wid_count(&self) -> u16 {
        self.senders.len() as u16
    }

    /// Posts a job onto `wid`'s queue. Equivalent to `sendWorkerMessageForceQueue`: the job is
    /// guaranteed to run, in order, even if the target worker is presently busy.
    pub fn post(&self, wid: Wid, job: impl FnOnce() + Send + 'static) {
        let sender = self
            .senders
            .get(wid as usize)
            .unwrap_or_else(|| panic!("no such worker: {wid}"));

        // The only way `send` fails is if the worker thread has already exited, which only
        // happens during `WorkerPool` teardown; there is nobody left to deliver the job to.
        let _ = sender.send(Box::new(job));
    }

    /// Drops all senders (closing every worker's channel) and joins each thread.
    pub fn shutdown(mut self) {
        self.senders.clear();
        for handle in self.handles.iter_mut().filter_map(Option::take) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.iter_mut().filter_map(Option::take) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_on_the_targeted_worker_in_order() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel();

        for i in 0..10 {
            let counter = counter.clone();
            let tx = tx.clone();
            pool.post(0, move || {
                let prev = counter.fetch_add(1, Ordering::SeqCst);
                tx.send((i, prev)).unwrap();
            });
        }
        drop(tx);

        let mut seen = Vec::new();
        for (i, prev) in rx {
            seen.push((i, prev));
        }

        assert_eq!(seen.len(), 10);
        for (idx, (i, prev)) in seen.iter().enumerate() {
            assert_eq!(*i, idx);
            assert_eq!(*prev, idx);
        }
    }
}
