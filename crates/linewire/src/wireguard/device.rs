//! The WireGuard device's upstream encrypt path: look up the peer that owns a packet's
//! destination address, pick a keypair still eligible to send on, pad and frame the packet as a
//! transport data message, and seal it with ChaCha20-Poly1305.
//!
//! Handshake negotiation is out of scope; [`Peer::rotate_keypair`] is how an
//! external handshake component hands this device a newly negotiated keypair.

use crate::error::WireguardError;
use crate::line::{LineBuffer, LineHandle};
use crate::tunnel::{Tunnel, TunnelChain};
use crate::wireguard::peer::Peer;
use crate::config::WireguardDeviceSettings;
use aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

const MESSAGE_TRANSPORT_DATA: u8 = 4;
const TRANSPORT_HEADER_LEN: usize = 16;
const PADDING_MULTIPLE: usize = 16;

/// Routes outbound packets to the peer that owns their destination and seals them for sending.
///
/// The peer table is one `RwLock` read-locked for the whole routing scan, and each peer then
/// guards its own keypairs independently (`boringtun`'s `Peer` does the same split, rather than
/// holding a single device-wide mutex across the table lookup and the AEAD seal). Packets for
/// different peers can be encrypted concurrently; only peers sharing a slot in the table ever
/// contend on `peers`, and only for the read-only scan.
pub struct WireguardDevice {
    peers: RwLock<Vec<Arc<Peer>>>,
    settings: WireguardDeviceSettings,
}

impl WireguardDevice {
    pub fn new(settings: WireguardDeviceSettings) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(Vec::new()),
            settings,
        })
    }

    /// Appends a peer to the routing table. Order matters: the ordered scan in
    /// [`find_peer_by_allowed_ip`] returns the first match in peer-insertion order, then the
    /// first matching entry within that peer's allowed-IP list.
    pub fn add_peer(&self, peer: Arc<Peer>) {
        self.peers.write().push(peer);
    }

    pub fn find_peer_by_allowed_ip(&self, ip: &IpAddr) -> Option<Arc<Peer>> {
        self.peers.read().iter().find(|p| p.is_allowed_ip(ip)).cloned()
    }

    fn encrypt_and_forward(
        &self,
        chain: &Arc<TunnelChain>,
        index: usize,
        line: &LineHandle,
        mut buf: LineBuffer,
    ) {
        let Some(dest) = destination_of(&buf) else {
            tracing::debug!(line = line.id, "wireguard: packet too short to read an IP header, dropping");
            return;
        };

        let Some(peer) = self.find_peer_by_allowed_ip(&dest) else {
            tracing::debug!(line = line.id, %dest, "wireguard: no peer claims this destination, dropping");
            return;
        };

        if let Err(err) = seal_transport_frame(&peer, &self.settings, &mut buf) {
            tracing::debug!(line = line.id, peer = peer.index(), %err, "wireguard: dropping packet");
            return;
        }

        chain.next_up_stream_payload(index, line, buf);
    }

    /// Produces a bare keep-alive transport frame for `peer`: an empty payload sealed with
    /// whatever keypair [`encrypt_and_forward`] would have picked, without any routing lookup.
    /// When and whether to send it is the handshake/timer component's decision; this only does
    /// the sealing.
    pub fn seal_keepalive(
        &self,
        peer: &Peer,
        buffer_pool: &bufferpool::BufferPool<Vec<u8>>,
    ) -> Result<LineBuffer, WireguardError> {
        let mut buf = buffer_pool.pull_initialised(&[]);
        seal_transport_frame(peer, &self.settings, &mut buf)?;
        Ok(buf)
    }
}

fn seal_transport_frame(
    peer: &Peer,
    settings: &WireguardDeviceSettings,
    buf: &mut LineBuffer,
) -> Result<(), WireguardError> {
    let (key, remote_index, counter) = select_sending_keypair(peer, settings)?;

    pad_to_multiple(buf, PADDING_MULTIPLE);

    {
        let header = buf.shift_start_left(TRANSPORT_HEADER_LEN);
        header[0] = MESSAGE_TRANSPORT_DATA;
        header[4..8].copy_from_slice(&remote_index.to_le_bytes());
        header[8..16].copy_from_slice(&counter.to_le_bytes());
    }

    let cipher = ChaCha20Poly1305::new(&key);
    let nonce = transport_nonce(counter);
    let plaintext = buf[TRANSPORT_HEADER_LEN..].to_vec();

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| WireguardError::Crypto)?;

    buf.truncate(TRANSPORT_HEADER_LEN);
    buf.extend_from_slice(&ciphertext);

    Ok(())
}

impl Tunnel for WireguardDevice {
    fn up_stream_payload(&self, chain: &Arc<TunnelChain>, index: usize, line: &LineHandle, buf: LineBuffer) {
        self.encrypt_and_forward(chain, index, line, buf);
    }
}

fn select_sending_keypair(
    peer: &Peer,
    settings: &WireguardDeviceSettings,
) -> Result<(Key, u32, u64), WireguardError> {
    let mut current_rejected = false;
    {
        let guard = peer.current_keypair().read();
        if let Some(kp) = guard.as_ref() {
            // A responder-side keypair that hasn't received anything yet isn't eligible to send
            // on: fall back to the previous keypair without discarding this one, it just needs
            // confirmation first.
            if kp.initiator() || kp.has_received() {
                let counter = kp.peek_counter();
                if kp.is_rejected(settings, counter) {
                    current_rejected = true;
                } else {
                    if kp.needs_rekey(settings, counter) {
                        peer.mark_needs_rekey();
                    }
                    let reserved = kp.advance_counter();
                    return Ok((kp.key().clone(), kp.remote_index(), reserved));
                }
            }
        }
    }
    if current_rejected {
        peer.discard_current_keypair();
    }

    let mut previous_rejected = false;
    {
        let guard = peer.previous_keypair().read();
        if let Some(kp) = guard.as_ref() {
            let counter = kp.peek_counter();
            if kp.is_rejected(settings, counter) {
                previous_rejected = true;
            } else {
                let reserved = kp.advance_counter();
                return Ok((kp.key().clone(), kp.remote_index(), reserved));
            }
        }
    }
    if previous_rejected {
        peer.discard_previous_keypair();
    }

    Err(WireguardError::NoValidKeypair)
}

fn pad_to_multiple(buf: &mut LineBuffer, align: usize) {
    let len = buf.len();
    let remainder = len % align;
    if remainder != 0 {
        buf.resize(len + (align - remainder), 0);
    }
}

/// WireGuard's transport nonce: four zero bytes followed by the little-endian counter.
fn transport_nonce(counter: u64) -> Nonce {
    let mut raw = [0u8; 12];
    raw[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(raw)
}

fn destination_of(buf: &[u8]) -> Option<IpAddr> {
    let version = buf.first()? >> 4;
    match version {
        4 => {
            if buf.len() < 20 {
                return None;
            }
            Some(IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19])))
        }
        6 => {
            if buf.len() < 40 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::allowed_ips::AllowedIp;
    use crate::wireguard::keypair::Keypair;
    use crate::worker::WorkerPool;
    use bufferpool::BufferPool;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        payloads: StdMutex<Vec<Vec<u8>>>,
    }

    impl Tunnel for RecordingSink {
        fn up_stream_payload(&self, _chain: &Arc<TunnelChain>, _index: usize, _line: &LineHandle, buf: LineBuffer) {
            self.payloads.lock().unwrap().push(buf[..].to_vec());
        }
    }

    fn ipv4_packet(dest: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 20 + payload.len()];
        packet[0] = 0x45; // version 4, IHL 5
        packet[16..20].copy_from_slice(&dest.octets());
        packet[20..].copy_from_slice(payload);
        packet
    }

    #[test]
    fn unmatched_destination_is_dropped_without_forwarding() {
        let device = WireguardDevice::new(WireguardDeviceSettings::default());
        let sink = Arc::new(RecordingSink { payloads: StdMutex::new(Vec::new()) });
        let workers = Arc::new(WorkerPool::new(1));
        let chain = Arc::new(TunnelChain::new(vec![device.clone(), sink.clone()], workers));
        let line_pool = crate::line::LinePool::new(2048);
        let line = line_pool.create_line(0);

        let pool = BufferPool::<Vec<u8>>::new(2048, "test");
        let buf = pool.pull_initialised(&ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), b"hi"));

        chain.up_stream_payload(0, &line, buf);
        assert!(sink.payloads.lock().unwrap().is_empty());
    }

    #[test]
    fn matched_peer_without_keypair_is_dropped() {
        let device = WireguardDevice::new(WireguardDeviceSettings::default());
        device.add_peer(Arc::new(Peer::new(
            1,
            vec![AllowedIp::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 24)],
        )));
        let sink = Arc::new(RecordingSink { payloads: StdMutex::new(Vec::new()) });
        let workers = Arc::new(WorkerPool::new(1));
        let chain = Arc::new(TunnelChain::new(vec![device.clone(), sink.clone()], workers));
        let line_pool = crate::line::LinePool::new(2048);
        let line = line_pool.create_line(0);

        let pool = BufferPool::<Vec<u8>>::new(2048, "test");
        let buf = pool.pull_initialised(&ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), b"hi"));

        chain.up_stream_payload(0, &line, buf);
        assert!(sink.payloads.lock().unwrap().is_empty());
    }

    #[test]
    fn matched_peer_with_keypair_forwards_a_framed_ciphertext() {
        let device = WireguardDevice::new(WireguardDeviceSettings::default());
        let peer = Arc::new(Peer::new(
            1,
            vec![AllowedIp::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 24)],
        ));
        peer.rotate_keypair(Keypair::new([9u8; 32], 55, true));
        device.add_peer(peer);

        let sink = Arc::new(RecordingSink { payloads: StdMutex::new(Vec::new()) });
        let workers = Arc::new(WorkerPool::new(1));
        let chain = Arc::new(TunnelChain::new(vec![device.clone(), sink.clone()], workers));
        let line_pool = crate::line::LinePool::new(2048);
        let line = line_pool.create_line(0);

        let pool = BufferPool::<Vec<u8>>::new(2048, "test");
        let plaintext = ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), b"hello world");
        let plaintext_len = plaintext.len();
        let buf = pool.pull_initialised(&plaintext);

        chain.up_stream_payload(0, &line, buf);

        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let framed = &payloads[0];
        assert_eq!(framed[0], MESSAGE_TRANSPORT_DATA);
        assert_eq!(u32::from_le_bytes(framed[4..8].try_into().unwrap()), 55);
        assert_eq!(u64::from_le_bytes(framed[8..16].try_into().unwrap()), 0);
        // padded plaintext + 16-byte Poly1305 tag.
        let remainder = plaintext_len % PADDING_MULTIPLE;
        let padded_len = if remainder == 0 {
            plaintext_len
        } else {
            plaintext_len + (PADDING_MULTIPLE - remainder)
        };
        assert_eq!(framed.len(), TRANSPORT_HEADER_LEN + padded_len + 16);
    }

    #[test]
    fn keepalive_seals_an_empty_payload_and_advances_the_counter_by_one() {
        let device = WireguardDevice::new(WireguardDeviceSettings::default());
        let peer = Peer::new(1, vec![]);
        peer.rotate_keypair(Keypair::new([9u8; 32], 55, true));

        let pool = BufferPool::<Vec<u8>>::new(2048, "test");
        let frame = device.seal_keepalive(&peer, &pool).unwrap();

        assert_eq!(frame.len(), TRANSPORT_HEADER_LEN + 16);
        assert_eq!(frame[0], MESSAGE_TRANSPORT_DATA);
        assert_eq!(u64::from_le_bytes(frame[8..16].try_into().unwrap()), 0);
        assert_eq!(peer.current_keypair().read().as_ref().unwrap().peek_counter(), 1);
    }

    #[test]
    fn keypair_past_reject_threshold_is_discarded_without_advancing_the_counter() {
        let settings = WireguardDeviceSettings {
            reject_after_messages: 3,
            ..WireguardDeviceSettings::default()
        };
        let device = WireguardDevice::new(settings);
        let peer = Peer::new(1, vec![]);
        let kp = Keypair::new([9u8; 32], 55, true);
        kp.advance_counter();
        kp.advance_counter();
        kp.advance_counter();
        peer.rotate_keypair(kp);

        let pool = BufferPool::<Vec<u8>>::new(2048, "test");
        let result = device.seal_keepalive(&peer, &pool);

        assert!(result.is_err());
        assert!(peer.current_keypair().read().is_none());
    }

    #[test]
    fn responder_keypair_without_any_received_data_falls_back_to_previous() {
        let device = WireguardDevice::new(WireguardDeviceSettings::default());
        let peer = Peer::new(1, vec![]);

        // previous: an initiator keypair, eligible to send on immediately.
        peer.rotate_keypair(Keypair::new([1u8; 32], 50, true));
        // current: a responder keypair that hasn't received anything yet, demoting the one above
        // to previous.
        peer.rotate_keypair(Keypair::new([2u8; 32], 60, false));

        let pool = BufferPool::<Vec<u8>>::new(2048, "test");
        let frame = device.seal_keepalive(&peer, &pool).unwrap();

        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), 50);
        assert_eq!(peer.previous_keypair().read().as_ref().unwrap().peek_counter(), 1);
        assert_eq!(peer.current_keypair().read().as_ref().unwrap().peek_counter(), 0);
    }

    #[test]
    fn responder_keypair_sends_once_it_has_received_a_packet() {
        let device = WireguardDevice::new(WireguardDeviceSettings::default());
        let peer = Peer::new(1, vec![]);
        peer.rotate_keypair(Keypair::new([2u8; 32], 60, false));
        peer.record_keypair_received(60);

        let pool = BufferPool::<Vec<u8>>::new(2048, "test");
        let frame = device.seal_keepalive(&peer, &pool).unwrap();

        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), 60);
    }
}
