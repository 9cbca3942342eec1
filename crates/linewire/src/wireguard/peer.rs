//! A WireGuard peer: its routing entries and its current/previous keypair pair.

use crate::wireguard::allowed_ips::AllowedIp;
use crate::wireguard::keypair::Keypair;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Peer {
    index: u32,
    allowed_ips: Vec<AllowedIp>,
    current_keypair: RwLock<Option<Keypair>>,
    previous_keypair: RwLock<Option<Keypair>>,
    /// Set once a send crosses a rekey threshold; cleared when the handshake component installs
    /// a fresh keypair via [`Peer::rotate_keypair`].
    needs_rekey: AtomicBool,
}

impl Peer {
    pub fn new(index: u32, allowed_ips: Vec<AllowedIp>) -> Self {
        Self {
            index,
            allowed_ips,
            current_keypair: RwLock::new(None),
            previous_keypair: RwLock::new(None),
            needs_rekey: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn allowed_ips(&self) -> &[AllowedIp] {
        &self.allowed_ips
    }

    pub fn is_allowed_ip(&self, ip: &std::net::IpAddr) -> bool {
        self.allowed_ips.iter().any(|a| a.contains(ip))
    }

    /// Installs a freshly negotiated keypair, demoting the current one to previous. Called by the
    /// (out of scope) handshake component, never by the data plane itself.
    pub fn rotate_keypair(&self, new: Keypair) {
        let mut current = self.current_keypair.write();
        let retiring = current.take();
        *current = Some(new);
        drop(current);
        *self.previous_keypair.write() = retiring;
        self.needs_rekey.store(false, Ordering::Release);
    }

    pub fn needs_rekey(&self) -> bool {
        self.needs_rekey.load(Ordering::Acquire)
    }

    pub(crate) fn mark_needs_rekey(&self) {
        self.needs_rekey.store(true, Ordering::Release);
    }

    pub(crate) fn current_keypair(&self) -> &RwLock<Option<Keypair>> {
        &self.current_keypair
    }

    pub(crate) fn previous_keypair(&self) -> &RwLock<Option<Keypair>> {
        &self.previous_keypair
    }

    /// Removes a keypair that has crossed its reject threshold so nothing tries to send on it
    /// again; `sending_counter` on a rejected attempt is otherwise left untouched.
    pub(crate) fn discard_current_keypair(&self) {
        self.current_keypair.write().take();
    }

    pub(crate) fn discard_previous_keypair(&self) {
        self.previous_keypair.write().take();
    }

    /// Marks whichever of `current`/`previous` was installed under `remote_index` as having
    /// received a transport packet. The (out-of-scope) receive path calls this; a responder-side
    /// keypair isn't eligible to send on until it does.
    pub fn record_keypair_received(&self, remote_index: u32) {
        if let Some(kp) = self.current_keypair.read().as_ref() {
            if kp.remote_index() == remote_index {
                kp.record_received();
                return;
            }
        }
        if let Some(kp) = self.previous_keypair.read().as_ref() {
            if kp.remote_index() == remote_index {
                kp.record_received();
            }
        }
    }
}
