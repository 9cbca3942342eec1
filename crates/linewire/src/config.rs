//! Typed tunable settings for the three cores.
//!
//! This module intentionally stops at the typed struct: parsing a settings file or CLI flags
//! into one of these is left to the embedding application.
//! `serde::Deserialize` is derived so an embedder can fill these in from whatever format they
//! already use (TOML, JSON, env vars via `envy`, ...).

use serde::Deserialize;
use std::time::Duration;

/// Maximum number of bytes buffered on an upload line while it waits in `UploadInTable` for its
/// rendezvous peer. The source this crate follows defines `kMaxBuffering` without giving a
/// literal value in the excerpt available to us; 64 KiB is a generous default for a handshake
/// preamble and is documented here rather than hard-coded in the state machine.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HalfDuplexSettings {
    pub max_buffering: usize,
}

impl Default for HalfDuplexSettings {
    fn default() -> Self {
        Self {
            max_buffering: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WireguardDeviceSettings {
    pub reject_after_messages: u64,
    pub rekey_after_messages: u64,
    #[serde(with = "duration_secs")]
    pub reject_after_time: Duration,
    #[serde(with = "duration_secs")]
    pub rekey_after_time: Duration,
}

impl Default for WireguardDeviceSettings {
    fn default() -> Self {
        Self {
            // WireGuard's published constants (whitepaper); the source this crate follows
            // inherits them unchanged.
            reject_after_messages: u64::MAX - (1 << 13),
            rekey_after_messages: 1u64 << 60,
            reject_after_time: Duration::from_secs(180),
            rekey_after_time: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub queue_max_length: u32,
    pub backpressure_high_watermark: usize,
    pub backpressure_sleep: Duration,
    pub read_packet_size: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            queue_max_length: 512,
            backpressure_high_watermark: 256,
            backpressure_sleep: Duration::from_millis(1),
            read_packet_size: 1500,
        }
    }
}

/// `manip_swap_tcp`: an IPv4 protocol number that should be rewritten to `IPPROTO_TCP` on the
/// way downstream (and back again on the way upstream). `0` disables the rewrite entirely.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct IpManipulatorSettings {
    pub swap_tcp: u8,
}

impl Default for IpManipulatorSettings {
    fn default() -> Self {
        Self { swap_tcp: 0 }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
