//! The tunnel contract: a uniform upstream/downstream callback interface, composed into a
//! chain. Each tunnel only intercepts the directions it cares about; the default methods pass
//! the call straight through to the neighbouring tunnel, the same shape as a real chain where
//! most stages are transparent to traffic they don't transform.

use crate::line::{LineBuffer, LineHandle};
use crate::worker::WorkerPool;
use std::sync::Arc;

pub trait Tunnel: Send + Sync {
    fn up_stream_init(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle) {
        chain.next_up_stream_init(index, line);
    }

    fn up_stream_payload(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle, buf: LineBuffer) {
        chain.next_up_stream_payload(index, line, buf);
    }

    fn up_stream_finish(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle) {
        chain.next_up_stream_finish(index, line);
    }

    fn down_stream_payload(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle, buf: LineBuffer) {
        chain.prev_down_stream_payload(index, line, buf);
    }

    fn down_stream_finish(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle) {
        chain.prev_down_stream_finish(index, line);
    }
}

/// An ordered stack of tunnels plus the worker pool used for cross-worker posting. `index` 0 is
/// closest to the network (capture device / listener side); the last entry is closest to the
/// application/egress side.
pub struct TunnelChain {
    tunnels: Vec<Arc<dyn Tunnel>>,
    workers: Arc<WorkerPool>,
}

impl TunnelChain {
    pub fn new(tunnels: Vec<Arc<dyn Tunnel>>, workers: Arc<WorkerPool>) -> Self {
        Self { tunnels, workers }
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Entry point for a line's first contact with the chain, e.g. from a listener or capture
    /// device handing it off at index 0.
    pub fn up_stream_init(self: &Arc<Self>, index: usize, line: &LineHandle) {
        self.tunnels[index].clone().up_stream_init(self, index, line);
    }

    /// Re-enters a tunnel's own upstream payload handler from scratch, as if the bytes had just
    /// arrived. Used by the half-duplex core after `pipe_to` re-pins a line to another worker.
    pub fn up_stream_payload(self: &Arc<Self>, index: usize, line: &LineHandle, buf: LineBuffer) {
        self.tunnels[index].clone().up_stream_payload(self, index, line, buf);
    }

    /// Entry point for a line finishing, e.g. from a listener or capture device tearing it down.
    pub fn up_stream_finish(self: &Arc<Self>, index: usize, line: &LineHandle) {
        self.tunnels[index].clone().up_stream_finish(self, index, line);
    }

    pub fn next_up_stream_init(self: &Arc<Self>, index: usize, line: &LineHandle) {
        if let Some(next) = self.tunnels.get(index + 1).cloned() {
            next.up_stream_init(self, index + 1, line);
        }
    }

    pub fn next_up_stream_payload(self: &Arc<Self>, index: usize, line: &LineHandle, buf: LineBuffer) {
        if let Some(next) = self.tunnels.get(index + 1).cloned() {
            next.up_stream_payload(self, index + 1, line, buf);
        }
    }

    pub fn next_up_stream_finish(self: &Arc<Self>, index: usize, line: &LineHandle) {
        if let Some(next) = self.tunnels.get(index + 1).cloned() {
            next.up_stream_finish(self, index + 1, line);
        }
    }

    pub fn prev_down_stream_payload(self: &Arc<Self>, index: usize, line: &LineHandle, buf: LineBuffer) {
        if index == 0 {
            return;
        }
        self.tunnels[index - 1].clone().down_stream_payload(self, index - 1, line, buf);
    }

    pub fn prev_down_stream_finish(self: &Arc<Self>, index: usize, line: &LineHandle) {
        if index == 0 {
            return;
        }
        self.tunnels[index - 1].clone().down_stream_finish(self, index - 1, line);
    }

    /// Re-pins `line` to `target_wid` and replays `buf` through `index`'s own upstream payload
    /// handler on that worker, so the match completes on a single worker. Mirrors `pipeTo` plus
    /// the immediate re-entrant forward to the next tunnel in the chain.
    pub fn pipe_to_and_replay(
        self: &Arc<Self>,
        index: usize,
        line: &LineHandle,
        target_wid: crate::worker::Wid,
        buf: LineBuffer,
    ) {
        line.pipe_to(target_wid);

        let chain = self.clone();
        let line = line.clone();
        self.workers
            .post(target_wid, move || chain.up_stream_payload(index, &line, buf));
    }

    /// Posts a job to `wid` carrying a cloned chain handle. Used by tunnels that need to reach
    /// across to a peer line's worker (e.g. cascading a finish to the other half of a spliced
    /// pair) without re-entering a payload handler.
    pub fn post(self: &Arc<Self>, wid: crate::worker::Wid, job: impl FnOnce(Arc<TunnelChain>) + Send + 'static) {
        let chain = self.clone();
        self.workers.post(wid, move || job(chain));
    }
}
