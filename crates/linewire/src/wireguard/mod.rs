//! The WireGuard device core: allowed-IP routing, keypair lifecycle bookkeeping, and the
//! ChaCha20-Poly1305 transport-data encrypt path.

pub mod allowed_ips;
pub mod device;
pub mod keypair;
pub mod peer;

pub use allowed_ips::AllowedIp;
pub use device::WireguardDevice;
pub use keypair::Keypair;
pub use peer::Peer;
