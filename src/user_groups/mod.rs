/// Per-user registry of every group-like thing the user belongs to.
///
/// Three closed variants share a base (priority, joined-at):
/// - `community` - open rooms on a community server, keyed by base url + room
/// - `legacy` - pre-`03` groups with a shared encryption key pair
/// - `group` - `03` groups, with optional admin key and auth credential
///
/// All of it lives in one merged store, synced only between the user's own
/// devices. Erasing an entry leaves a timestamp tombstone: fields written at
/// or before it are hidden, so a stale merge cannot bring the entry back.
pub mod community;
pub mod group;
pub mod legacy;
pub mod registry;

pub use community::{build_full_url, CommunityInfo, CommunityUrl};
pub use group::{GroupStatus, GroupUpdate, UserGroupInfo};
pub use legacy::{LegacyGroupInfo, LegacyMember};
pub use registry::UserGroupsRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::EncryptionError;
use crate::identity::IdentityError;
use crate::store::{Lww, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UserGroupsError {
    #[error("Invalid community url: {0}")]
    InvalidCommunityUrl(String),

    #[error("Community url has no public key")]
    MissingPubkey,

    #[error("Invalid community public key")]
    InvalidPubkey,

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Name too long ({0} bytes)")]
    NameTooLong(usize),

    #[error("Encryption key must be 32 bytes or empty, got {0}")]
    InvalidEncryptionKey(usize),

    #[error("Auth data must be 100 bytes, got {0}")]
    InvalidAuthData(usize),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Group was kicked or destroyed")]
    GroupTerminated,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] EncryptionError),
}

pub type Result<T> = std::result::Result<T, UserGroupsError>;

// ---------------------------------------------------------------------------
// Shared base
// ---------------------------------------------------------------------------

/// Fields every registry entry carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BaseGroup {
    /// < 0 hidden, 0 normal, > 0 pinned (higher first).
    pub priority: i64,
    pub joined_at_seconds: i64,
}

/// Stored form of [`BaseGroup`] plus the record's liveness clocks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct BaseRecord {
    priority: Lww<i64>,
    joined_at_seconds: Lww<i64>,
    /// Lamport time of the latest local write to the record.
    touched_at: u64,
    /// Lamport time of the latest erase.
    erased_at: u64,
}

impl BaseRecord {
    pub(crate) fn is_live(&self) -> bool {
        self.touched_at > self.erased_at
    }

    pub(crate) fn erased_at(&self) -> u64 {
        self.erased_at
    }

    pub(crate) fn view(&self) -> BaseGroup {
        BaseGroup {
            priority: self.priority.visible_after(self.erased_at),
            joined_at_seconds: self.joined_at_seconds.visible_after(self.erased_at),
        }
    }

    pub(crate) fn touch(&mut self, ts: u64) {
        self.touched_at = self.touched_at.max(ts);
    }

    pub(crate) fn erase(&mut self, ts: u64) {
        self.erased_at = self.erased_at.max(ts);
    }

    pub(crate) fn set_priority(&mut self, priority: i64, ts: u64) -> bool {
        write_visible(&mut self.priority, priority, ts, self.erased_at)
    }

    pub(crate) fn set_joined_at(&mut self, seconds: i64, ts: u64) -> bool {
        write_visible(&mut self.joined_at_seconds, seconds, ts, self.erased_at)
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.priority.merge(&other.priority);
        self.joined_at_seconds.merge(&other.joined_at_seconds);
        self.touched_at = self.touched_at.max(other.touched_at);
        self.erased_at = self.erased_at.max(other.erased_at);
    }
}

/// Write `value` if it differs from what is visible past `horizon`.
///
/// Re-stamps an equal but hidden value so it survives the tombstone.
pub(crate) fn write_visible<T>(reg: &mut Lww<T>, value: T, ts: u64, horizon: u64) -> bool
where
    T: Serialize + Clone + PartialEq + Default,
{
    if reg.visible_after(horizon) == value {
        return false;
    }
    reg.stamp(value, ts)
}

/// Secret bytes held by the registry (admin keys, auth data, legacy keys).
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        SecretBytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// UserGroupEntry
// ---------------------------------------------------------------------------

/// One registry entry of any variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserGroupEntry {
    Community(CommunityInfo),
    LegacyGroup(LegacyGroupInfo),
    Group(UserGroupInfo),
}

impl UserGroupEntry {
    pub fn base(&self) -> &BaseGroup {
        match self {
            UserGroupEntry::Community(c) => &c.base,
            UserGroupEntry::LegacyGroup(l) => &l.base,
            UserGroupEntry::Group(g) => &g.base,
        }
    }

    pub fn priority(&self) -> i64 {
        self.base().priority
    }

    /// Stable sort key within the registry.
    pub fn key(&self) -> String {
        match self {
            UserGroupEntry::Community(c) => c.key(),
            UserGroupEntry::LegacyGroup(l) => l.session_id.to_hex(),
            UserGroupEntry::Group(g) => g.session_id.to_hex(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
