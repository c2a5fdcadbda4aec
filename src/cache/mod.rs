/// Cache-aside session caching
///
/// `SessionCache` orchestrates lookups against the router and the session
/// store of record; write-backs and evictions run on a bounded background
/// queue.
pub mod session;
pub mod store;
pub mod writeback;

pub use session::{CachedSession, SessionCache};
pub use store::{Session, SessionStore};
pub use writeback::WritebackQueue;

use sha2::{Digest, Sha256};

/// One-way fingerprint of a session token. Raw tokens never reach the key
/// space or the logs.
pub fn fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = fingerprint("token-a");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint("token-a"));
        assert_ne!(fp, fingerprint("token-b"));
        assert!(!fp.contains("token"));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
