use sha2::{Digest, Sha256};

/// Compute the SHA256 hash of data (hex-encoded).
///
/// Used by the config watchers to detect changed store records without
/// keeping full copies of the previous values around.
pub fn content_hash(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}
