/// Shared machinery for every merged config store.
///
/// - `lww`: per-field lamport registers and authority-tiered registers
/// - `base`: the generic store (clock, dirty flags, push/dump/merge)
/// - `message`: the signed + encrypted envelope pushes travel in
///
/// Dumps are `[DUMP_FORMAT_VERSION][kind][bincode(snapshot)]`. Push payloads
/// are CBOR via ciborium, like every other payload in the crate.

pub mod base;
pub mod lww;
pub mod message;

pub use base::{ConfigState, ConfigStore};
pub use lww::{Authority, Lww, Tiered};
pub use message::ConfigMessage;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::crypto::EncryptionError;
use crate::limits::DUMP_FORMAT_VERSION;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("Malformed dump: {0}")]
    MalformedDump(String),

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("Data belongs to store kind {got}, expected {expected:?}")]
    WrongKind { expected: StoreKind, got: u8 },

    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),

    #[error("Bincode serialization failed: {0}")]
    BincodeError(String),

    #[error("Message exceeds max size ({size} > {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message signature verification failed")]
    AuthenticationFailed,

    #[error("No retained key decrypts the message")]
    DecryptionFailed,

    #[error("Crypto error: {0}")]
    Crypto(#[from] EncryptionError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// StoreKind
// ---------------------------------------------------------------------------

/// Which store a push, dump or incoming message belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum StoreKind {
    GroupInfo = 1,
    GroupMembers = 2,
    GroupKeys = 3,
    UserGroups = 4,
}

impl StoreKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(StoreKind::GroupInfo),
            2 => Some(StoreKind::GroupMembers),
            3 => Some(StoreKind::GroupKeys),
            4 => Some(StoreKind::UserGroups),
            _ => None,
        }
    }

    /// String name for logs and host bindings.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::GroupInfo => "groupInfo",
            StoreKind::GroupMembers => "groupMembers",
            StoreKind::GroupKeys => "groupKeys",
            StoreKind::UserGroups => "userGroups",
        }
    }
}

// ---------------------------------------------------------------------------
// Push / dump entries
// ---------------------------------------------------------------------------

/// One message to hand to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushEntry {
    pub kind: StoreKind,
    pub seqno: u64,
    pub data: Vec<u8>,
}

/// One blob to hand to persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpEntry {
    pub kind: StoreKind,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Encode a dump: version byte, kind byte, bincode body.
pub fn encode_dump<T: Serialize>(kind: StoreKind, value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value).map_err(|e| StoreError::BincodeError(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(DUMP_FORMAT_VERSION);
    out.push(kind.as_u8());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a dump produced by [`encode_dump`] for the same kind.
pub fn decode_dump<T: DeserializeOwned>(kind: StoreKind, data: &[u8]) -> Result<T> {
    if data.len() < 2 {
        return Err(StoreError::MalformedDump("truncated header".into()));
    }
    if data[0] != DUMP_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion(data[0]));
    }
    if data[1] != kind.as_u8() {
        return Err(StoreError::WrongKind {
            expected: kind,
            got: data[1],
        });
    }
    bincode::deserialize(&data[2..]).map_err(|e| StoreError::MalformedDump(e.to_string()))
}

pub(crate) fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn cbor_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::CborDecode(e.to_string()))
}

/// Wall clock in milliseconds. A clock before the epoch reads as 0.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall clock in seconds.
pub(crate) fn now_secs() -> i64 {
    (now_ms() / 1000) as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
