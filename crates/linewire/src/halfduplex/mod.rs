//! Half-duplex rendezvous pairing: splices two unidirectional connections — an "upload"
//! and a "download" — that arrive independently, possibly on different workers, into a single
//! `main_line` once both halves of the same rendezvous hash have shown up.
//!
//! Grounded on the upstream payload/finish state machine of a half-duplex proxy core: a line is
//! `Unknown` until its first 8-byte header is fully buffered, then moves to `UploadInTable` or
//! `DownloadInTable` while it waits for its rendezvous peer, and finally to `UploadDirect` /
//! `DownloadDirect` once spliced onto a `main_line` shared with that peer.

use crate::config::HalfDuplexSettings;
use crate::line::{LineBuffer, LineHandle, LinePool};
use crate::tunnel::{Tunnel, TunnelChain};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// High bit of the header's first byte: set means "download", clear means "upload". Since
/// the 8-byte header is read little-endian, this is bit 7 of the whole `u64`, not its sign bit.
const DOWNLOAD_BIT: u64 = 0x80;
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRole {
    Unknown,
    UploadInTable,
    DownloadInTable,
    UploadDirect,
    DownloadDirect,
}

#[derive(Default)]
struct LineState {
    role_set: Option<LineRole>,
    hash: u64,
    buffering: Option<LineBuffer>,
    upload_line: Option<LineHandle>,
    download_line: Option<LineHandle>,
    main_line: Option<LineHandle>,
}

impl LineState {
    fn role(&self) -> LineRole {
        self.role_set.unwrap_or(LineRole::Unknown)
    }
}

/// Reads the rendezvous header without mutating the buffer, so a cross-worker replay of the same
/// bytes (via [`TunnelChain::pipe_to_and_replay`]) re-parses identically.
fn parse_header(buf: &LineBuffer) -> (bool, u64) {
    let mut raw_bytes = [0u8; HEADER_LEN];
    raw_bytes.copy_from_slice(&buf[..HEADER_LEN]);
    let raw = u64::from_le_bytes(raw_bytes);
    let is_download = raw & DOWNLOAD_BIT != 0;
    let hash = raw & !DOWNLOAD_BIT;
    (is_download, hash)
}

fn concat(prior: Option<LineBuffer>, next: LineBuffer) -> LineBuffer {
    match prior {
        Some(mut prior) => {
            prior.extend_from_slice(&next[..]);
            prior
        }
        None => next,
    }
}

/// Which side of the splice just arrived and completed the match.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Arrived {
    Upload,
    Download,
}

pub struct HalfDuplexTunnel {
    upload_by_hash: Mutex<HashMap<u64, LineHandle>>,
    download_by_hash: Mutex<HashMap<u64, LineHandle>>,
    states: Mutex<HashMap<u64, LineState>>,
    line_pool: LinePool,
    settings: HalfDuplexSettings,
}

impl HalfDuplexTunnel {
    pub fn new(line_pool: LinePool, settings: HalfDuplexSettings) -> Arc<Self> {
        Arc::new(Self {
            upload_by_hash: Mutex::new(HashMap::new()),
            download_by_hash: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            line_pool,
            settings,
        })
    }

    fn role_of(&self, line_id: u64) -> LineRole {
        self.states
            .lock()
            .get(&line_id)
            .map(LineState::role)
            .unwrap_or(LineRole::Unknown)
    }

    fn handle_unknown(
        &self,
        chain: &Arc<TunnelChain>,
        index: usize,
        line: &LineHandle,
        buf: LineBuffer,
    ) {
        let buf = {
            let mut states = self.states.lock();
            let prior = states.get_mut(&line.id).and_then(|s| s.buffering.take());
            concat(prior, buf)
        };

        if buf.len() < HEADER_LEN {
            let mut states = self.states.lock();
            states.entry(line.id).or_default().buffering = Some(buf);
            return;
        }

        let (is_download, hash) = parse_header(&buf);
        if is_download {
            self.handle_download_unknown(chain, index, line, hash, buf);
        } else {
            self.handle_upload_unknown(chain, index, line, hash, buf);
        }
    }

    fn handle_upload_unknown(
        &self,
        chain: &Arc<TunnelChain>,
        index: usize,
        line: &LineHandle,
        hash: u64,
        buf: LineBuffer,
    ) {
        enum Found {
            Local(LineHandle),
            Remote(LineHandle),
            None,
        }

        let found = {
            let mut dl = self.download_by_hash.lock();
            match dl.get(&hash).cloned() {
                Some(peer) if peer.wid() == line.wid() => {
                    dl.remove(&hash);
                    Found::Local(peer)
                }
                Some(peer) => Found::Remote(peer),
                None => Found::None,
            }
        };

        match found {
            Found::Local(peer) => {
                self.splice_local(chain, index, line, &peer, Arrived::Upload, buf);
            }
            Found::Remote(peer) => {
                self.states.lock().remove(&line.id);
                chain.pipe_to_and_replay(index, line, peer.wid(), buf);
            }
            Found::None => {
                let mut ul = self.upload_by_hash.lock();
                if ul.contains_key(&hash) {
                    drop(ul);
                    tracing::warn!(hash, line = line.id, "half-duplex: duplicate upload rendezvous, closing");
                    self.states.lock().remove(&line.id);
                    chain.prev_down_stream_finish(index, line);
                    return;
                }
                ul.insert(hash, line.clone());
                drop(ul);

                let mut states = self.states.lock();
                let state = states.entry(line.id).or_default();
                state.role_set = Some(LineRole::UploadInTable);
                state.hash = hash;
                state.buffering = Some(buf);
            }
        }
    }

    fn handle_download_unknown(
        &self,
        chain: &Arc<TunnelChain>,
        index: usize,
        line: &LineHandle,
        hash: u64,
        buf: LineBuffer,
    ) {
        enum Found {
            Local(LineHandle),
            Remote(LineHandle),
            None,
        }

        let found = {
            let mut ul = self.upload_by_hash.lock();
            match ul.get(&hash).cloned() {
                Some(peer) if peer.wid() == line.wid() => {
                    ul.remove(&hash);
                    Found::Local(peer)
                }
                Some(peer) => Found::Remote(peer),
                None => Found::None,
            }
        };

        match found {
            Found::Local(peer) => {
                // The download side never carries payload into the splice: its own header bytes
                // are discarded either way, and `splice_local` drops `buf` for us.
                self.splice_local(chain, index, line, &peer, Arrived::Download, buf);
            }
            Found::Remote(peer) => {
                self.states.lock().remove(&line.id);
                chain.pipe_to_and_replay(index, line, peer.wid(), buf);
            }
            Found::None => {
                drop(buf);
                let mut dl = self.download_by_hash.lock();
                if dl.contains_key(&hash) {
                    drop(dl);
                    tracing::warn!(hash, line = line.id, "half-duplex: duplicate download rendezvous, closing");
                    self.states.lock().remove(&line.id);
                    chain.prev_down_stream_finish(index, line);
                    return;
                }
                dl.insert(hash, line.clone());
                drop(dl);

                let mut states = self.states.lock();
                let state = states.entry(line.id).or_default();
                state.role_set = Some(LineRole::DownloadInTable);
                state.hash = hash;
            }
        }
    }

    fn handle_in_table_payload(&self, line: &LineHandle, buf: LineBuffer) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&line.id) else {
            return;
        };

        let merged = concat(state.buffering.take(), buf);
        if merged.len() >= self.settings.max_buffering {
            tracing::debug!(
                line = line.id,
                len = merged.len(),
                "half-duplex: buffering limit reached, dropping buffered bytes"
            );
            drop(merged);
        } else {
            state.buffering = Some(merged);
        }
    }

    fn handle_direct_payload(
        &self,
        chain: &Arc<TunnelChain>,
        index: usize,
        line: &LineHandle,
        buf: LineBuffer,
    ) {
        let main_line = {
            self.states
                .lock()
                .get(&line.id)
                .and_then(|s| s.main_line.clone())
        };

        if let Some(main_line) = main_line {
            chain.next_up_stream_payload(index, &main_line, buf);
        }
    }

    /// Splices `arriving` (whose rendezvous hash just matched) and `peer` onto a fresh
    /// `main_line`, forwards whichever side's data is ready, and marks both lines `*Direct`.
    fn splice_local(
        &self,
        chain: &Arc<TunnelChain>,
        index: usize,
        arriving: &LineHandle,
        peer: &LineHandle,
        arrived: Arrived,
        buf: LineBuffer,
    ) {
        let main_line = self.line_pool.create_line(arriving.wid());

        let (upload_line, download_line) = match arrived {
            Arrived::Upload => (arriving.clone(), peer.clone()),
            Arrived::Download => (peer.clone(), arriving.clone()),
        };

        let forward_buf = {
            let mut states = self.states.lock();

            states.insert(
                main_line.id,
                LineState {
                    upload_line: Some(upload_line.clone()),
                    download_line: Some(download_line.clone()),
                    main_line: Some(main_line.clone()),
                    ..LineState::default()
                },
            );

            let (arriving_role, peer_role) = match arrived {
                Arrived::Upload => (LineRole::UploadDirect, LineRole::DownloadDirect),
                Arrived::Download => (LineRole::DownloadDirect, LineRole::UploadDirect),
            };

            {
                let s = states.entry(arriving.id).or_default();
                s.role_set = Some(arriving_role);
                s.main_line = Some(main_line.clone());
                s.upload_line = Some(upload_line.clone());
                s.download_line = Some(download_line.clone());
            }
            {
                let s = states.entry(peer.id).or_default();
                s.role_set = Some(peer_role);
                s.main_line = Some(main_line.clone());
                s.upload_line = Some(upload_line.clone());
                s.download_line = Some(download_line.clone());
            }

            match arrived {
                Arrived::Upload => Some(buf),
                Arrived::Download => {
                    drop(buf);
                    states.get_mut(&peer.id).and_then(|s| s.buffering.take())
                }
            }
        };

        main_line.lock();
        chain.next_up_stream_init(index, &main_line);

        if !main_line.is_alive() {
            drop(forward_buf);
            main_line.unlock();
            return;
        }
        main_line.unlock();

        if let Some(mut fb) = forward_buf {
            fb.shift_start_right(HEADER_LEN);
            if !fb.is_empty() {
                chain.next_up_stream_payload(index, &main_line, fb);
            }
        }
    }
}

impl Tunnel for HalfDuplexTunnel {
    fn up_stream_payload(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle, buf: LineBuffer) {
        match self.role_of(line.id) {
            LineRole::Unknown => self.handle_unknown(chain, index, line, buf),
            LineRole::UploadInTable | LineRole::DownloadInTable => {
                self.handle_in_table_payload(line, buf)
            }
            LineRole::UploadDirect | LineRole::DownloadDirect => {
                self.handle_direct_payload(chain, index, line, buf)
            }
        }
    }

    fn up_stream_finish(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle) {
        let Some(state) = self.states.lock().remove(&line.id) else {
            return;
        };

        match state.role() {
            LineRole::Unknown => {
                drop(state.buffering);
            }
            LineRole::UploadInTable => {
                let removed = self.upload_by_hash.lock().remove(&state.hash);
                assert!(
                    removed.is_some(),
                    "half-duplex: upload_by_hash missing entry for line {} at finish",
                    line.id
                );
                drop(state.buffering);
            }
            LineRole::DownloadInTable => {
                let removed = self.download_by_hash.lock().remove(&state.hash);
                assert!(
                    removed.is_some(),
                    "half-duplex: download_by_hash missing entry for line {} at finish",
                    line.id
                );
            }
            LineRole::UploadDirect | LineRole::DownloadDirect => {
                if let Some(main_line) = state.main_line.clone() {
                    self.states.lock().remove(&main_line.id);
                    chain.next_up_stream_finish(index, &main_line);
                }

                let counterpart = match state.role() {
                    LineRole::DownloadDirect => state.upload_line.clone(),
                    _ => state.download_line.clone(),
                };

                if let Some(counterpart) = counterpart {
                    let counterpart_wid = counterpart.wid();
                    // Destroy the counterpart's state synchronously, before the cross-worker post,
                    // so nothing can re-enter this cascade a second time if the counterpart's own
                    // finish arrives through some other path afterwards.
                    self.states.lock().remove(&counterpart.id);
                    chain.post(counterpart_wid, move |chain| {
                        chain.prev_down_stream_finish(index, &counterpart);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPool;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        inits: StdMutex<Vec<u64>>,
        payloads: StdMutex<Vec<(u64, Vec<u8>)>>,
        finishes: StdMutex<Vec<u64>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inits: StdMutex::new(Vec::new()),
                payloads: StdMutex::new(Vec::new()),
                finishes: StdMutex::new(Vec::new()),
            })
        }
    }

    impl Tunnel for RecordingSink {
        fn up_stream_init(&self, _chain: &Arc<TunnelChain>, _index: usize, line: &LineHandle) {
            self.inits.lock().unwrap().push(line.id);
        }

        fn up_stream_payload(&self, _chain: &Arc<TunnelChain>, _index: usize, line: &LineHandle, buf: LineBuffer) {
            self.payloads.lock().unwrap().push((line.id, buf[..].to_vec()));
        }

        fn up_stream_finish(&self, _chain: &Arc<TunnelChain>, _index: usize, line: &LineHandle) {
            self.finishes.lock().unwrap().push(line.id);
        }
    }

    fn header(hash: u64, download: bool) -> [u8; 8] {
        let mut raw = hash & !DOWNLOAD_BIT;
        if download {
            raw |= DOWNLOAD_BIT;
        }
        raw.to_le_bytes()
    }

    fn setup() -> (LinePool, Arc<HalfDuplexTunnel>, Arc<RecordingSink>, Arc<TunnelChain>) {
        let line_pool = LinePool::new(4096);
        let hd = HalfDuplexTunnel::new(line_pool.clone(), HalfDuplexSettings::default());
        let sink = RecordingSink::new();
        let workers = Arc::new(WorkerPool::new(2));
        let chain = Arc::new(TunnelChain::new(vec![hd.clone(), sink.clone()], workers));
        (line_pool, hd, sink, chain)
    }

    #[test]
    fn upload_arrives_first_then_download_completes_the_splice() {
        let (line_pool, _hd, sink, chain) = setup();
        let upload_line = line_pool.create_line(0);
        let download_line = line_pool.create_line(0);

        let mut up_buf = line_pool.buffer_pool().pull_initialised(&header(0xABCD, false));
        up_buf.extend_from_slice(b"hello");
        chain.up_stream_payload(0, &upload_line, up_buf);

        assert!(sink.payloads.lock().unwrap().is_empty());

        let dl_buf = line_pool.buffer_pool().pull_initialised(&header(0xABCD, true));
        chain.up_stream_payload(0, &download_line, dl_buf);

        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].1, b"hello");
    }

    #[test]
    fn duplicate_upload_rendezvous_is_rejected() {
        let (line_pool, _hd, _sink, chain) = setup();
        let a = line_pool.create_line(0);
        let b = line_pool.create_line(0);

        chain.up_stream_payload(0, &a, line_pool.buffer_pool().pull_initialised(&header(7, false)));
        chain.up_stream_payload(0, &b, line_pool.buffer_pool().pull_initialised(&header(7, false)));
        // Second upload with the same hash is a duplicate and gets closed downstream instead of
        // panicking or silently overwriting the first registration.
    }

    #[test]
    fn short_header_is_buffered_until_complete() {
        let (line_pool, hd, _sink, _chain) = setup();
        let line = line_pool.create_line(0);

        let partial = line_pool.buffer_pool().pull_initialised(&[1, 2, 3]);
        assert_eq!(hd.role_of(line.id), LineRole::Unknown);
        hd.handle_unknown(&Arc::new(TunnelChain::new(vec![], Arc::new(WorkerPool::new(1)))), 0, &line, partial);
        assert_eq!(hd.role_of(line.id), LineRole::Unknown);
        assert!(hd.states.lock().get(&line.id).unwrap().buffering.is_some());
    }

    #[test]
    fn upload_finish_without_match_removes_its_table_entry() {
        let (line_pool, hd, _sink, chain) = setup();
        let line = line_pool.create_line(0);
        chain.up_stream_payload(0, &line, line_pool.buffer_pool().pull_initialised(&header(99, false)));
        assert_eq!(hd.role_of(line.id), LineRole::UploadInTable);

        chain.up_stream_finish(0, &line);
        assert!(hd.upload_by_hash.lock().get(&99).is_none());
    }
}
