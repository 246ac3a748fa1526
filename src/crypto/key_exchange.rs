use rand_core::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Derive the X25519 keypair that shares its scalar with an Ed25519 seed.
///
/// The scalar is the first half of SHA-512(seed), the same one Ed25519 signs
/// with, so the X25519 public key is the Montgomery form of the Ed25519 key.
///
/// # Returns
/// (public_key, secret_key)
pub fn x25519_from_ed25519_seed(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let digest = Sha512::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);

    let secret = StaticSecret::from(scalar);
    scalar.zeroize();
    let public = PublicKey::from(&secret);

    (public.to_bytes(), secret.to_bytes())
}

/// Generate a one-off X25519 keypair for wrapping key messages
///
/// # Returns
/// (public_key, secret_key)
pub fn generate_ephemeral_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public.to_bytes(), secret.to_bytes())
}

/// X25519 agreement. Returns `None` when the peer key is a low-order point.
pub fn derive_shared_secret(our_secret: &[u8; 32], their_public: &[u8; 32]) -> Option<[u8; 32]> {
    let secret = StaticSecret::from(*our_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return None;
    }
    Some(shared.to_bytes())
}
