//! Streaming multi-algorithm content digests.
//!
//! Every file is addressed by its canonical internal hash (SHA-256 hex)
//! and advertised under one URI per supported algorithm, formatted as
//! `<algo>:<hex>`. URI slot 0 is the primary (SHA-256) address.

use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Maximum length of the algorithm part of a content URI.
pub const MAX_ALGO_LEN: usize = 31;
/// Maximum length of the hex part of a content URI.
pub const MAX_HASH_LEN: usize = 127;

/// Finished digests for one byte stream.
#[derive(Debug, Clone)]
pub struct Digests {
    /// Canonical content address (SHA-256 hex).
    pub internal_hash: String,
    /// Content URIs, primary first.
    pub uris: Vec<String>,
}

/// Incremental hasher fed alongside the temp-file write path.
pub struct Hasher {
    sha256: Sha256,
    sha1: Sha1,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            sha1: Sha1::new(),
        }
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.sha256.update(buf);
        self.sha1.update(buf);
    }

    pub fn finish(self) -> Digests {
        let sha256 = hex::encode(self.sha256.finalize());
        let sha1 = hex::encode(self.sha1.finalize());
        Digests {
            uris: vec![format!("sha256:{sha256}"), format!("sha1:{sha1}")],
            internal_hash: sha256,
        }
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a content URI into `(algo, hex)`, or `None` if it isn't one.
pub fn parse_uri(uri: &str) -> Option<(&str, &str)> {
    let (algo, hash) = uri.split_once(':')?;
    if algo.is_empty() || algo.len() > MAX_ALGO_LEN {
        return None;
    }
    if !algo.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    if hash.is_empty() || hash.len() > MAX_HASH_LEN {
        return None;
    }
    // Lowercase hex only; that's the only form the hasher emits.
    if !hash
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    Some((algo, hash))
}
