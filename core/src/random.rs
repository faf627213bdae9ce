//! Injectable randomness, used for sentinel nonces and session IDs.
//!
//! Kept behind a trait (rather than calling `rand::rng()` inline at each call
//! site) so tests can supply deterministic sequences and assert on exact
//! nonce/ID values instead of just shapes.

use rand::RngCore;

pub trait Random: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl Random for OsRandom {
    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Lowercase hex token of `n_bytes` random bytes (`2 * n_bytes` hex chars).
pub fn hex_token(random: &dyn Random, n_bytes: usize) -> String {
    let mut buf = vec![0u8; n_bytes];
    random.fill_bytes(&mut buf);
    hex_encode(&buf)
}

/// `sess_` followed by 16 lowercase hex characters, per the session ID format.
pub fn generate_session_id(random: &dyn Random) -> String {
    format!("sess_{}", hex_token(random, 8))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Cycles through a fixed byte sequence so tests can assert exact IDs.
    pub struct FakeRandom {
        next_byte: Mutex<u8>,
    }

    impl FakeRandom {
        pub fn new() -> Self {
            Self {
                next_byte: Mutex::new(0),
            }
        }
    }

    impl Random for FakeRandom {
        fn fill_bytes(&self, buf: &mut [u8]) {
            #[allow(clippy::unwrap_used)]
            let mut n = self.next_byte.lock().unwrap();
            for slot in buf.iter_mut() {
                *slot = *n;
                *n = n.wrapping_add(1);
            }
        }
    }
}
