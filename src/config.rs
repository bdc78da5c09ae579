//! Tunables threaded through a session instead of read from globals
//! (§9 Design Notes: "replace global singletons with an explicit context
//! struct").

use std::time::Duration;

/// Per-connection read/write buffer size the back-pressure cap is
/// expressed as a multiple of (§4.4, §9 constants: `bufsz`).
pub const BUFFER_SIZE: u64 = 256 * 1024;

/// Protocol knobs shared by every session a [`crate::reactor::Reactor`]
/// drives. Defaults match the numbers named in §4/§5/§6.
#[derive(Clone, Debug)]
pub struct Config {
    /// Lowest protocol version this side will speak.
    pub min_version: u8,
    /// Highest protocol version this side will speak; the session
    /// negotiates down to `min(local_max, peer_max)` (§4.2).
    pub max_version: u8,
    /// Frame payload cap (§4.1): 2^28 bytes.
    pub max_payload: u64,
    /// Blobs smaller than this are sent uncompressed; larger ones are
    /// gzipped (§6.3 Crypto collaborator).
    pub gzip_threshold: usize,
    /// Soft cap on unacknowledged bytes in flight before the transfer
    /// engine pauses sending (§4.4): 10x the per-frame buffer size.
    pub backpressure_soft_cap: u64,
    /// A session with no frame activity for this long is evicted (§5).
    pub idle_timeout: Duration,
    /// RSA key size used when a session generates a fresh keypair for
    /// itself (not when authenticating with an existing one).
    pub rsa_key_bits: usize,
    /// TCP port the reactor listens on by default (§6.1).
    pub default_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_version: 1,
            max_version: 1,
            max_payload: netsync_core::DEFAULT_MAX_PAYLOAD,
            gzip_threshold: 256,
            backpressure_soft_cap: 10 * BUFFER_SIZE,
            idle_timeout: Duration::from_secs(21_600),
            rsa_key_bits: 2048,
            default_port: 4691,
        }
    }
}
