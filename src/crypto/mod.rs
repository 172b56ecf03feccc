/// Cryptographic collaborators used by the event graph.
///
/// - `signing` — Ed25519 server keys, event signatures
/// - `hashing` — reference hashes (event identifiers) and content hashes
pub mod hashing;
pub mod signing;

pub use hashing::{content_hash, decode_b64, encode_b64, reference_hash};
pub use signing::{generate_keypair, verify_signature, ServerSigningKey, SigningError};
