/// Identity types.
///
/// - `SessionId`: 33-byte prefixed public key. `0x05` + X25519 key for users,
///   `0x03` + Ed25519 key for groups.
/// - `UserKeys`: the local user's Ed25519 signing key and derived X25519 key.
/// - `GroupKeys`: a group's Ed25519 public key and, on admin devices, its secret.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::key_exchange::x25519_from_ed25519_seed;
use crate::crypto::signing::{self, SigningError};

/// Prefix byte of user session ids.
pub const USER_PREFIX: u8 = 0x05;

/// Prefix byte of group session ids.
pub const GROUP_PREFIX: u8 = 0x03;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Unknown session id prefix 0x{0:02x}")]
    InvalidPrefix(u8),

    #[error("Expected a {expected} session id")]
    WrongKind { expected: &'static str },

    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Secret key does not match the public key")]
    KeyMismatch,

    #[error("Invalid Ed25519 public key")]
    InvalidPublicKey,
}

impl From<SigningError> for IdentityError {
    fn from(e: SigningError) -> Self {
        match e {
            SigningError::InvalidKeyLength { expected, got } => {
                IdentityError::InvalidKeyLength { expected, got }
            }
            SigningError::KeyMismatch => IdentityError::KeyMismatch,
            SigningError::InvalidPublicKey => IdentityError::InvalidPublicKey,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Prefixed public key addressing a user or a group.
///
/// Ordering is bytewise, so `BTreeMap<SessionId, _>` iterates deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(#[serde(with = "BigArray")] [u8; 33]);

impl SessionId {
    /// User session id from an X25519 public key.
    pub fn user(x25519_pubkey: &[u8; 32]) -> Self {
        Self::with_prefix(USER_PREFIX, x25519_pubkey)
    }

    /// Group session id from the group's Ed25519 public key.
    pub fn group(ed25519_pubkey: &[u8; 32]) -> Self {
        Self::with_prefix(GROUP_PREFIX, ed25519_pubkey)
    }

    fn with_prefix(prefix: u8, key: &[u8; 32]) -> Self {
        let mut id = [0u8; 33];
        id[0] = prefix;
        id[1..].copy_from_slice(key);
        SessionId(id)
    }

    /// Parse 33 raw bytes; the prefix must be a known one.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 33 {
            return Err(IdentityError::InvalidKeyLength {
                expected: 33,
                got: bytes.len(),
            });
        }
        if bytes[0] != USER_PREFIX && bytes[0] != GROUP_PREFIX {
            return Err(IdentityError::InvalidPrefix(bytes[0]));
        }
        let mut id = [0u8; 33];
        id.copy_from_slice(bytes);
        Ok(SessionId(id))
    }

    /// Decode from a 66-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Decode a hex session id that must address a user.
    pub fn user_from_hex(s: &str) -> Result<Self, IdentityError> {
        let id = Self::from_hex(s)?;
        if !id.is_user() {
            return Err(IdentityError::WrongKind { expected: "user" });
        }
        Ok(id)
    }

    /// Decode a hex session id that must address a group.
    pub fn group_from_hex(s: &str) -> Result<Self, IdentityError> {
        let id = Self::from_hex(s)?;
        if !id.is_group() {
            return Err(IdentityError::WrongKind { expected: "group" });
        }
        Ok(id)
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn is_user(&self) -> bool {
        self.0[0] == USER_PREFIX
    }

    pub fn is_group(&self) -> bool {
        self.0[0] == GROUP_PREFIX
    }

    /// The 32-byte key without its prefix.
    pub fn pubkey(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.0[1..]);
        key
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    /// Hex-encode for display/storage.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}..)", &self.to_hex()[..10])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// UserKeys
// ---------------------------------------------------------------------------

/// The local user's key material, derived from a 64-byte Ed25519 secret key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct UserKeys {
    ed25519_seed: [u8; 32],
    ed25519_public: [u8; 32],
    x25519_secret: [u8; 32],
    x25519_public: [u8; 32],
}

impl UserKeys {
    /// Build from the 64-byte `seed || public_key` Ed25519 secret key.
    pub fn from_secret_key(secret_key: &[u8]) -> Result<Self, IdentityError> {
        let (seed, ed25519_public) = signing::split_secret_key(secret_key)?;
        let (x25519_public, x25519_secret) = x25519_from_ed25519_seed(&seed);
        Ok(UserKeys {
            ed25519_seed: seed,
            ed25519_public,
            x25519_secret,
            x25519_public,
        })
    }

    /// The user's `05` session id.
    pub fn session_id(&self) -> SessionId {
        SessionId::user(&self.x25519_public)
    }

    pub fn ed25519_public(&self) -> &[u8; 32] {
        &self.ed25519_public
    }

    pub fn x25519_public(&self) -> &[u8; 32] {
        &self.x25519_public
    }

    pub(crate) fn ed25519_seed(&self) -> &[u8; 32] {
        &self.ed25519_seed
    }

    pub(crate) fn x25519_secret(&self) -> &[u8; 32] {
        &self.x25519_secret
    }
}

impl fmt::Debug for UserKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserKeys({:?})", self.session_id())
    }
}

// ---------------------------------------------------------------------------
// GroupKeys
// ---------------------------------------------------------------------------

/// A group's identity. The secret seed is only present on admin devices.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct GroupKeys {
    public: [u8; 32],
    seed: Option<[u8; 32]>,
}

impl GroupKeys {
    /// Build from a 32-byte Ed25519 public key and an optional 64-byte secret key.
    pub fn new(public_key: &[u8], secret_key: Option<&[u8]>) -> Result<Self, IdentityError> {
        if public_key.len() != 32 {
            return Err(IdentityError::InvalidKeyLength {
                expected: 32,
                got: public_key.len(),
            });
        }
        let mut public = [0u8; 32];
        public.copy_from_slice(public_key);
        ed25519_dalek::VerifyingKey::from_bytes(&public)
            .map_err(|_| IdentityError::InvalidPublicKey)?;

        let seed = match secret_key {
            None => None,
            Some(sk) => {
                let (seed, derived) = signing::split_secret_key(sk)?;
                if derived != public {
                    return Err(IdentityError::KeyMismatch);
                }
                Some(seed)
            }
        };

        Ok(GroupKeys { public, seed })
    }

    /// The group's `03` session id.
    pub fn session_id(&self) -> SessionId {
        SessionId::group(&self.public)
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    /// Admin devices hold the group secret key.
    pub fn is_admin(&self) -> bool {
        self.seed.is_some()
    }

    pub(crate) fn seed(&self) -> Option<&[u8; 32]> {
        self.seed.as_ref()
    }
}

impl fmt::Debug for GroupKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GroupKeys({:?}, admin={})",
            self.session_id(),
            self.is_admin()
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
