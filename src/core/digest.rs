//! One-way digests for credential material.
//!
//! Lookups only ever compare digests, so the algorithm can change without
//! touching the resolve path.

use sha2::{Digest, Sha256};
use std::fmt::Write;

pub trait KeyDigest: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digest;

impl KeyDigest for Sha256Digest {
    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.finalize().to_vec()
    }
}

/// Lowercase hex rendering.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Hex digest of a plaintext key, the form stored in the credential store.
pub fn hash_key(digest: &dyn KeyDigest, plaintext: &str) -> String {
    to_hex(&digest.digest(plaintext.as_bytes()))
}
