use sha2::{Digest, Sha256};

/// SHA-256 of the raw upload bytes, lowercase hex.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
