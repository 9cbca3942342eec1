//! End-to-end: a plaintext IP packet sent through a [`WireguardDevice`] comes out the other side
//! as a framed, authenticated ciphertext that decrypts back to the original bytes under the same
//! key. The unit tests next to `device.rs` only check the frame's header fields and length; this
//! is the one place that actually reverses the seal.

use aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use linewire::worker::WorkerPool;
use linewire::{AllowedIp, Keypair, LineBuffer, LineHandle, LinePool, Peer, Tunnel, TunnelChain, WireguardDevice, WireguardDeviceSettings};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

struct RecordingSink {
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl Tunnel for RecordingSink {
    fn up_stream_payload(&self, _chain: &Arc<TunnelChain>, _index: usize, _line: &LineHandle, buf: LineBuffer) {
        self.payloads.lock().unwrap().push(buf[..].to_vec());
    }
}

fn ipv4_packet(dest: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20 + payload.len()];
    packet[0] = 0x45;
    packet[16..20].copy_from_slice(&dest.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

fn transport_nonce(counter: u64) -> Nonce {
    let mut raw = [0u8; 12];
    raw[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(raw)
}

#[test]
fn encrypted_transport_frame_decrypts_back_to_the_original_plaintext() {
    let raw_key = [42u8; 32];

    let device = WireguardDevice::new(WireguardDeviceSettings::default());
    let peer = Arc::new(Peer::new(1, vec![AllowedIp::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 24)]));
    peer.rotate_keypair(Keypair::new(raw_key, 77, true));
    device.add_peer(peer);

    let sink = Arc::new(RecordingSink { payloads: Mutex::new(Vec::new()) });
    let workers = Arc::new(WorkerPool::new(1));
    let chain = Arc::new(TunnelChain::new(vec![device.clone(), sink.clone()], workers));
    let line_pool = LinePool::new(2048);
    let line = line_pool.create_line(0);

    let plaintext = ipv4_packet(Ipv4Addr::new(10, 0, 0, 5), b"round trip payload");
    let buf = line_pool.buffer_pool().pull_initialised(&plaintext);
    chain.up_stream_payload(0, &line, buf);

    let payloads = sink.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 1);
    let frame = &payloads[0];

    assert_eq!(frame[0], 4, "MESSAGE_TRANSPORT_DATA");
    let remote_index = u32::from_le_bytes(frame[4..8].try_into().unwrap());
    assert_eq!(remote_index, 77);
    let counter = u64::from_le_bytes(frame[8..16].try_into().unwrap());
    assert_eq!(counter, 0);

    let key = Key::from(raw_key);
    let cipher = ChaCha20Poly1305::new(&key);
    let nonce = transport_nonce(counter);
    let decrypted = cipher
        .decrypt(&nonce, &frame[16..])
        .expect("ciphertext must decrypt under the same key and counter-derived nonce");

    assert!(decrypted.starts_with(&plaintext));
    assert!(decrypted[plaintext.len()..].iter().all(|&b| b == 0), "padding must be zero bytes");
}
