use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::events::ids::ServerName;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid signature")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Generate an Ed25519 keypair
///
/// # Returns
/// (public_key, private_key) - Both as 32-byte arrays
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);

    let secret_key = signing_key.to_bytes();
    let public_key = signing_key.verifying_key().to_bytes();

    (public_key, secret_key)
}

/// Verify Ed25519 signature
///
/// Returns `Ok(false)` for a well-formed but wrong signature, `Err` when the
/// key or signature bytes have the wrong shape.
pub fn verify_signature(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
    if public_key.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }

    if signature.len() != 64 {
        return Err(SigningError::InvalidSignature);
    }

    let mut pub_bytes = [0u8; 32];
    pub_bytes.copy_from_slice(public_key);
    let verifying_key =
        VerifyingKey::from_bytes(&pub_bytes).map_err(|_| SigningError::InvalidKeyLength)?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(signature);
    let sig = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(data, &sig).is_ok())
}

/// The local server's signing identity.
///
/// Every locally originated event is signed with this key under the server's
/// name. The private half never leaves this struct.
pub struct ServerSigningKey {
    server_name: ServerName,
    key: SigningKey,
}

impl ServerSigningKey {
    /// Fresh random key for `server_name`.
    pub fn generate(server_name: ServerName) -> Self {
        ServerSigningKey {
            server_name,
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from a stored 32-byte private key.
    pub fn from_bytes(server_name: ServerName, private_key: &[u8]) -> Result<Self> {
        if private_key.len() != 32 {
            return Err(SigningError::InvalidKeyLength);
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(private_key);
        Ok(ServerSigningKey {
            server_name,
            key: SigningKey::from_bytes(&key_bytes),
        })
    }

    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.key.sign(data).to_bytes()
    }
}

impl std::fmt::Debug for ServerSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ServerSigningKey({}, {})",
            self.server_name,
            &hex::encode(self.public_key())[..8]
        )
    }
}
