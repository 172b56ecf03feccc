/// Hashes over the canonical form of an event.
///
/// - Reference hash: BLAKE3, becomes the event identifier.
/// - Content hash: SHA-256, stored in `hashes.sha256` and checked on receipt.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64, Engine as _};
use sha2::{Digest, Sha256};

/// BLAKE3 of the canonical bytes (signatures and event_id removed).
pub fn reference_hash(canonical: &[u8]) -> [u8; 32] {
    *blake3::hash(canonical).as_bytes()
}

/// SHA-256 of the canonical bytes (signatures, hashes and event_id removed).
pub fn content_hash(canonical: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    hasher.finalize().into()
}

/// Unpadded URL-safe base64, the encoding used for ids, hashes and signatures.
pub fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    B64.decode(s)
}
