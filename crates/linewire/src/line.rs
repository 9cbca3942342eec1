//! `Line`: a handle for a single transport-layer connection, pinned to one worker.

use crate::worker::Wid;
use bufferpool::BufferPool;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

/// A payload buffer as it travels through the tunnel chain. Reused from a [`BufferPool`]; the
/// owner at any instant is whoever currently holds it.
pub type LineBuffer = bufferpool::Buffer<Vec<u8>>;

static NEXT_LINE_ID: AtomicUsize = AtomicUsize::new(1);

/// A connection handle. Identified per worker; destroyed when its lock count reaches zero and no
/// tunnel still holds state for it.
pub struct Line {
    pub id: u64,
    wid: AtomicU16,
    alive: AtomicBool,
    lock_count: AtomicUsize,
    buffer_pool: BufferPool<Vec<u8>>,
}

pub type LineHandle = Arc<Line>;

impl Line {
    fn new(wid: Wid, buffer_pool: BufferPool<Vec<u8>>) -> LineHandle {
        Arc::new(Line {
            id: NEXT_LINE_ID.fetch_add(1, Ordering::Relaxed) as u64,
            wid: AtomicU16::new(wid),
            alive: AtomicBool::new(true),
            lock_count: AtomicUsize::new(1),
            buffer_pool,
        })
    }

    pub fn wid(&self) -> Wid {
        self.wid.load(Ordering::Acquire)
    }

    /// Re-pins the line to a different worker. Only valid to call from the worker that currently
    /// owns the line; subsequent dispatch on this line must be posted to the new worker.
    pub fn pipe_to(&self, wid: Wid) {
        self.wid.store(wid, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn buffer_pool(&self) -> &BufferPool<Vec<u8>> {
        &self.buffer_pool
    }

    /// Increments the lock count, keeping the line alive across a cross-worker hop.
    pub fn lock(&self) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the lock count; once it reaches zero the line is marked dead. Idempotent past
    /// zero is a programmer error (double-unlock) and is reported as such rather than silently
    /// ignored, matching the source's `locked` double-unlock guard in spirit.
    pub fn unlock(&self) {
        let prev = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "line unlocked more times than it was locked");
        if prev == 1 {
            self.alive.store(false, Ordering::Release);
        }
    }
}

/// The "tunnel-chain container" service: owns the buffer pool and hands out fresh synthetic
/// lines (e.g. the half-duplex core's `main_line`).
#[derive(Clone)]
pub struct LinePool {
    buffer_pool: BufferPool<Vec<u8>>,
}

impl LinePool {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_pool: BufferPool::new(buffer_capacity, "linewire"),
        }
    }

    pub fn buffer_pool(&self) -> &BufferPool<Vec<u8>> {
        &self.buffer_pool
    }

    /// Creates a brand-new line pinned to `wid`, alive with a lock count of one.
    pub fn create_line(&self, wid: Wid) -> LineHandle {
        Line::new(wid, self.buffer_pool.clone())
    }
}
