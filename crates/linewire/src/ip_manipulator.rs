//! Rewrites the IPv4 protocol field of packets crossing a tunnel that only understands plain
//! TCP/UDP, swapping a configured protocol number for `IPPROTO_TCP` downstream and undoing the
//! swap upstream so the original protocol reaches whatever sits behind this tunnel.
//!
//! This is the simplest tunnel in the chain: it never buffers, never crosses workers, and never
//! allocates a synthetic line the way the half-duplex core does. It exists to show the tunnel
//! ABI's minimal shape — a payload rewrite plus a pass-through everywhere else.

use crate::line::{LineBuffer, LineHandle};
use crate::tunnel::{Tunnel, TunnelChain};
use crate::config::IpManipulatorSettings;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

const IPPROTO_TCP: u8 = 6;

const IPV4_PROTOCOL_OFFSET: usize = 9;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Swaps a configured protocol number for plain TCP on the way downstream, and swaps it back on
/// the way upstream. Lines that were rewritten downstream are tracked so the upstream side knows
/// to undo it and so a downstream checksum recompute can be flagged once and only once.
pub struct IpManipulator {
    settings: IpManipulatorSettings,
    checksum_dirty: Mutex<HashSet<u64>>,
}

impl IpManipulator {
    pub fn new(settings: IpManipulatorSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            checksum_dirty: Mutex::new(HashSet::new()),
        })
    }

    /// Whether `line` currently carries a packet this tunnel rewrote and that still needs its
    /// checksum recomputed by whatever sits downstream of it.
    pub fn is_checksum_dirty(&self, line: &LineHandle) -> bool {
        self.checksum_dirty.lock().contains(&line.id)
    }

    fn mark_checksum_dirty(&self, line: &LineHandle) {
        self.checksum_dirty.lock().insert(line.id);
    }

    fn clear_checksum_dirty(&self, line: &LineHandle) {
        self.checksum_dirty.lock().remove(&line.id);
    }
}

impl Tunnel for IpManipulator {
    fn down_stream_payload(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle, mut buf: LineBuffer) {
        let swap = self.settings.swap_tcp;
        if swap != 0 && is_ipv4(&buf) && protocol_of(&buf) == Some(swap) {
            set_protocol(&mut buf, IPPROTO_TCP);
            self.mark_checksum_dirty(line);
        }

        chain.prev_down_stream_payload(index, line, buf);
    }

    fn up_stream_payload(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle, mut buf: LineBuffer) {
        let swap = self.settings.swap_tcp;
        if swap != 0 && self.is_checksum_dirty(line) && is_ipv4(&buf) && protocol_of(&buf) == Some(IPPROTO_TCP) {
            set_protocol(&mut buf, swap);
            self.clear_checksum_dirty(line);
        }

        chain.next_up_stream_payload(index, line, buf);
    }

    /// Mirrors a packet-tunnel interface, which has no upstream close of its own to cascade
    /// to — a downstream finish reaching this tunnel is a programmer error, not a protocol event.
    fn down_stream_finish(&self, _chain: &Arc<TunnelChain>, _index: usize, line: &LineHandle) {
        panic!("ip_manipulator: down_stream_finish reached a packet-tunnel interface (line {})", line.id);
    }

    fn up_stream_finish(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle) {
        self.clear_checksum_dirty(line);
        chain.next_up_stream_finish(index, line);
    }
}

fn is_ipv4(buf: &[u8]) -> bool {
    buf.len() >= IPV4_MIN_HEADER_LEN && (buf[0] >> 4) == 4
}

fn protocol_of(buf: &[u8]) -> Option<u8> {
    buf.get(IPV4_PROTOCOL_OFFSET).copied()
}

fn set_protocol(buf: &mut [u8], protocol: u8) {
    buf[IPV4_PROTOCOL_OFFSET] = protocol;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPool;

    struct RecordingSink {
        payloads: Mutex<Vec<Vec<u8>>>,
        finishes: Mutex<usize>,
    }

    impl Tunnel for RecordingSink {
        fn up_stream_payload(&self, _chain: &Arc<TunnelChain>, _index: usize, _line: &LineHandle, buf: LineBuffer) {
            self.payloads.lock().push(buf[..].to_vec());
        }

        fn up_stream_finish(&self, _chain: &Arc<TunnelChain>, _index: usize, _line: &LineHandle) {
            *self.finishes.lock() += 1;
        }
    }

    fn ipv4_packet(protocol: u8) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[9] = protocol;
        packet
    }

    fn setup(swap_tcp: u8) -> (Arc<IpManipulator>, Arc<RecordingSink>, Arc<TunnelChain>, LineHandle) {
        let manipulator = IpManipulator::new(IpManipulatorSettings { swap_tcp });
        let sink = Arc::new(RecordingSink {
            payloads: Mutex::new(Vec::new()),
            finishes: Mutex::new(0),
        });
        let workers = Arc::new(WorkerPool::new(1));
        let chain = Arc::new(TunnelChain::new(vec![manipulator.clone(), sink.clone()], workers));
        let line_pool = crate::line::LinePool::new(2048);
        let line = line_pool.create_line(0);
        (manipulator, sink, chain, line)
    }

    #[test]
    fn downstream_swap_is_disabled_when_setting_is_zero() {
        let (manipulator, _sink, chain, line) = setup(0);
        let pool = bufferpool::BufferPool::<Vec<u8>>::new(2048, "test");
        let buf = pool.pull_initialised(&ipv4_packet(77));
        manipulator.down_stream_payload(&chain, 0, &line, buf);
        assert!(!manipulator.is_checksum_dirty(&line));
    }

    #[test]
    fn matching_protocol_is_rewritten_and_tracked_dirty() {
        let (manipulator, _sink, chain, line) = setup(77);
        let pool = bufferpool::BufferPool::<Vec<u8>>::new(2048, "test");
        let buf = pool.pull_initialised(&ipv4_packet(77));
        manipulator.down_stream_payload(&chain, 0, &line, buf);
        assert!(manipulator.is_checksum_dirty(&line));
    }

    #[test]
    fn upstream_swap_restores_the_original_protocol() {
        let (manipulator, sink, chain, line) = setup(77);
        manipulator.mark_checksum_dirty(&line);
        let pool = bufferpool::BufferPool::<Vec<u8>>::new(2048, "test");
        let buf = pool.pull_initialised(&ipv4_packet(IPPROTO_TCP));
        chain.up_stream_payload(0, &line, buf);

        let payloads = sink.payloads.lock();
        assert_eq!(payloads[0][9], 77);
        assert!(!manipulator.is_checksum_dirty(&line));
    }

    #[test]
    #[should_panic(expected = "down_stream_finish")]
    fn down_stream_finish_is_fatal() {
        let (manipulator, _sink, chain, line) = setup(77);
        manipulator.down_stream_finish(&chain, 0, &line);
    }
}
