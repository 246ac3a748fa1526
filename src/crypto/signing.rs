use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SigningError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("Secret key does not match its public half")]
    KeyMismatch,
    #[error("Invalid public key")]
    InvalidPublicKey,
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Generate an Ed25519 keypair
///
/// # Returns
/// (public_key, secret_key); the secret key is the 64-byte `seed || public_key` form
pub fn generate_keypair() -> ([u8; 32], [u8; 64]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (
        signing_key.verifying_key().to_bytes(),
        signing_key.to_keypair_bytes(),
    )
}

/// Split a 64-byte `seed || public_key` secret key, checking the halves agree.
pub fn split_secret_key(secret_key: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if secret_key.len() != 64 {
        return Err(SigningError::InvalidKeyLength {
            expected: 64,
            got: secret_key.len(),
        });
    }

    let mut seed = [0u8; 32];
    seed.copy_from_slice(&secret_key[..32]);
    let public = public_from_seed(&seed);
    if public[..] != secret_key[32..] {
        seed.zeroize();
        return Err(SigningError::KeyMismatch);
    }
    Ok((seed, public))
}

/// Derive the Ed25519 public key of a 32-byte seed.
pub fn public_from_seed(seed: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}

/// Sign data with an Ed25519 seed
///
/// # Returns
/// 64-byte signature
pub fn sign_data(data: &[u8], seed: &[u8; 32]) -> [u8; 64] {
    SigningKey::from_bytes(seed).sign(data).to_bytes()
}

/// Verify an Ed25519 signature
///
/// # Returns
/// `Ok(false)` for a well-formed but invalid signature
pub fn verify_signature(data: &[u8], signature: &[u8], public_key: &[u8; 32]) -> Result<bool> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SigningError::InvalidPublicKey)?;

    let sig = match Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };

    Ok(verifying_key.verify(data, &sig).is_ok())
}
