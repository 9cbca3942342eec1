/// Errors surfaced across the crate's `Result`-returning entry points.
///
/// Invariant violations (a missing rendezvous map entry at finish, a corrupt keypair table) are
/// *not* represented here: the source this crate follows treats them as unrecoverable and
/// terminates (`LOGF(...); exit(1);`). We follow the same policy with `panic!`, not a `Result`
/// variant, so callers cannot accidentally swallow a corrupt-state condition.
#[derive(Debug, thiserror::Error)]
pub enum WireguardError {
    #[error("no valid keypair available to send on")]
    NoValidKeypair,
    #[error("keypair rejected: sending_counter or age past the reject threshold")]
    KeypairExpired,
    #[error("no peer matches the packet's destination address")]
    NoRoute,
    #[error("packet shorter than the minimum IP header length")]
    PacketTooShort,
    #[error("padded payload does not fit in the transport frame budget")]
    FrameTooLarge,
    #[error("AEAD seal/open failed")]
    Crypto,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("netlink socket setup failed: {0}")]
    Setup(#[source] std::io::Error),
    #[error("netfilter configuration message failed: {0}")]
    Config(&'static str),
    #[error("bring-up/bring-down command failed with status {0}")]
    CommandFailed(i32),
}
