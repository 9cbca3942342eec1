//! A user-space tunnel chain: compose a small set of per-direction packet/stream transforms
//! (half-duplex client rendezvous, WireGuard transport-data encryption, protocol-number
//! manipulation) behind a uniform [`Tunnel`] interface, fed either by the Linux `NFQUEUE` capture
//! device or by an embedder's own listener.
//!
//! Everything above the wire format is deliberately minimal: there is no handshake negotiation,
//! no configuration file parser, and no process supervisor here. An embedding application wires
//! up [`config`] structs, builds a [`tunnel::TunnelChain`], and drives it from whatever transport
//! it owns (a real listener, the bundled [`capture`] device, or a test harness).

pub mod config;
pub mod error;
pub mod halfduplex;
pub mod ip_manipulator;
pub mod line;
pub mod tunnel;
pub mod wireguard;
pub mod worker;

#[cfg(target_os = "linux")]
pub mod capture;

pub use config::{CaptureSettings, HalfDuplexSettings, IpManipulatorSettings, WireguardDeviceSettings};
pub use error::{CaptureError, WireguardError};
pub use halfduplex::HalfDuplexTunnel;
pub use ip_manipulator::IpManipulator;
pub use line::{LineBuffer, LineHandle, LinePool};
pub use tunnel::{Tunnel, TunnelChain};
pub use wireguard::{AllowedIp, Keypair, Peer, WireguardDevice};
pub use worker::{Wid, WorkerPool};
