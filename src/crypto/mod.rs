pub mod encryption;
pub mod key_exchange;
pub mod signing;

pub use encryption::{decrypt, derive_key, encrypt, EncryptionError, SymmetricKey};
pub use key_exchange::{derive_shared_secret, generate_ephemeral_keypair, x25519_from_ed25519_seed};
pub use signing::{
    generate_keypair, public_from_seed, sign_data, split_secret_key, verify_signature,
    SigningError,
};
