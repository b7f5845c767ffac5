//! Order id and capability-token issuance.
//!
//! Tokens are 32 bytes from the OS CSPRNG, hex-encoded (256 bits of
//! entropy), unpredictable and collision-free at any realistic order
//! volume. Comparison goes through [`token_matches`], which hashes both
//! sides before a `subtle` constant-time equality so neither content nor
//! length leaks through timing.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

const TOKEN_BYTES: usize = 32;

/// Fresh opaque order identifier.
pub fn new_order_id() -> Uuid {
    Uuid::new_v4()
}

/// Fresh high-entropy order token (hex, 64 chars).
pub fn new_order_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// Constant-time token comparison. Both inputs are reduced to fixed-length
/// SHA-256 digests first, so the comparison cost is independent of where
/// (or whether) the inputs differ.
pub fn token_matches(presented: &str, stored: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(stored.as_bytes());
    a.ct_eq(&b).into()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}
