//! A single WireGuard data-plane keypair and the lifecycle thresholds from the whitepaper
//! that govern when it may still be used to send and when a rekey becomes overdue.

#[cfg(feature = "mock-instant")]
use mock_instant::Instant;
#[cfg(not(feature = "mock-instant"))]
use std::time::Instant;

use crate::config::WireguardDeviceSettings;
use chacha20poly1305::Key;
use std::sync::atomic::{AtomicU64, Ordering};

/// One half of the current/previous keypair pair a peer holds. Established once by an external
/// handshake component and handed to this crate fully formed; this crate only tracks the
/// bookkeeping needed to keep using (or retire) it.
pub struct Keypair {
    key: Key,
    /// The index the remote peer expects to see in the `receiver` field of frames we send it.
    remote_index: u32,
    sending_counter: AtomicU64,
    established: Instant,
    initiator: bool,
    /// Nonzero once we've received at least one transport packet under this keypair. A
    /// responder-side keypair isn't eligible to send on until this has happened at least once.
    last_rx: AtomicU64,
}

impl Keypair {
    pub fn new(key: [u8; 32], remote_index: u32, initiator: bool) -> Self {
        Self {
            key: Key::from(key),
            remote_index,
            sending_counter: AtomicU64::new(0),
            established: Instant::now(),
            initiator,
            last_rx: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }

    /// Records that we've received at least one transport packet under this keypair. The
    /// (out-of-scope) receive path calls this; until it does, a responder-side keypair falls
    /// back to the previous one for sending.
    pub fn record_received(&self) {
        if self.last_rx.load(Ordering::Relaxed) == 0 {
            let millis = self.established.elapsed().as_millis() as u64;
            self.last_rx.store(millis.max(1), Ordering::Relaxed);
        }
    }

    pub fn has_received(&self) -> bool {
        self.last_rx.load(Ordering::Relaxed) != 0
    }

    /// The counter value that would be reserved by the next [`Keypair::advance_counter`] call,
    /// without reserving it. Callers must check [`Keypair::is_rejected`] against this value
    /// before advancing: a rejected send must leave `sending_counter` untouched.
    pub fn peek_counter(&self) -> u64 {
        self.sending_counter.load(Ordering::Relaxed)
    }

    /// Reserves the next sending counter value, the same one that goes into the frame's
    /// `counter` field and the AEAD nonce. Monotonic and never reused.
    pub fn advance_counter(&self) -> u64 {
        self.sending_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// True once `counter` (the value about to be reserved) or the keypair's age has crossed the
    /// reject threshold: the keypair must not be used to send again.
    pub fn is_rejected(&self, settings: &WireguardDeviceSettings, counter: u64) -> bool {
        counter >= settings.reject_after_messages || self.established.elapsed() >= settings.reject_after_time
    }

    /// True once either threshold for "should renegotiate soon" has been crossed. This crate only
    /// surfaces the signal (see [`crate::wireguard::peer::Peer::rekey_needed`]); acting on it is
    /// the handshake component's job. The time-based trigger only applies to the initiator side:
    /// a responder doesn't unilaterally decide a session is stale from elapsed time alone.
    pub fn needs_rekey(&self, settings: &WireguardDeviceSettings, counter: u64) -> bool {
        counter >= settings.rekey_after_messages
            || (self.initiator && self.established.elapsed() >= settings.rekey_after_time)
    }
}
