/// Group metadata: independent LWW registers for every group-level field.
///
/// Each field carries its own lamport timestamp, so concurrent edits of
/// different fields both survive a merge. The destroyed marker is monotone:
/// the greatest destruction timestamp seen is kept and is never cleared.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::{
    check_length, MAX_DESCRIPTION_LENGTH, MAX_NAME_LENGTH, MAX_URL_LENGTH, PROFILE_KEY_LENGTH,
};
use crate::store::{ConfigState, ConfigStore, Lww, StoreError, StoreKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Name too long ({0} bytes)")]
    NameTooLong(usize),

    #[error("Description too long ({0} bytes)")]
    DescriptionTooLong(usize),

    #[error("Profile picture url too long ({0} bytes)")]
    UrlTooLong(usize),

    #[error("Profile picture key must be 32 bytes, got {0}")]
    InvalidPictureKey(usize),

    #[error("Group has been destroyed")]
    Destroyed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

// ---------------------------------------------------------------------------
// ProfilePic
// ---------------------------------------------------------------------------

/// Url of an encrypted picture and the key that decrypts it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ProfilePic {
    pub url: String,
    pub key: Vec<u8>,
}

impl ProfilePic {
    pub fn new(url: impl Into<String>, key: Vec<u8>) -> Self {
        ProfilePic {
            url: url.into(),
            key,
        }
    }

    /// An empty url means "no picture".
    pub fn is_empty(&self) -> bool {
        self.url.is_empty()
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), MetadataError> {
        check_length(&self.url, MAX_URL_LENGTH).map_err(MetadataError::UrlTooLong)?;
        if !self.url.is_empty() && self.key.len() != PROFILE_KEY_LENGTH {
            return Err(MetadataError::InvalidPictureKey(self.key.len()));
        }
        Ok(())
    }
}

/// `None` for an empty picture.
pub(crate) fn normalize_pic(pic: ProfilePic) -> Option<ProfilePic> {
    if pic.is_empty() {
        None
    } else {
        Some(pic)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct InfoState {
    name: Lww<String>,
    description: Lww<String>,
    profile_pic: Lww<Option<ProfilePic>>,
    expiry_seconds: Lww<u32>,
    created_at: Lww<i64>,
    delete_before: Lww<i64>,
    delete_attach_before: Lww<i64>,
    destroyed_at: Option<u64>,
}

impl ConfigState for InfoState {
    const KIND: StoreKind = StoreKind::GroupInfo;

    fn merge(&mut self, other: &Self) {
        self.name.merge(&other.name);
        self.description.merge(&other.description);
        self.profile_pic.merge(&other.profile_pic);
        self.expiry_seconds.merge(&other.expiry_seconds);
        self.created_at.merge(&other.created_at);
        self.delete_before.merge(&other.delete_before);
        self.delete_attach_before.merge(&other.delete_attach_before);
        self.destroyed_at = self.destroyed_at.max(other.destroyed_at);
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Merged view of the group metadata. Unset fields read as `None`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct GroupInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub profile_picture: Option<ProfilePic>,
    /// Disappearing-message timer.
    pub expiry_seconds: Option<u32>,
    pub created_at: Option<i64>,
    /// Messages sent before this unix time should be deleted.
    pub delete_before: Option<i64>,
    /// Attachments sent before this unix time should be deleted.
    pub delete_attach_before: Option<i64>,
    pub destroyed: bool,
}

/// A local edit. `None` leaves a field untouched; an empty string, an empty
/// picture url or a zero clears it.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct InfoUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub profile_picture: Option<ProfilePic>,
    pub expiry_seconds: Option<u32>,
    pub created_at: Option<i64>,
    pub delete_before: Option<i64>,
    pub delete_attach_before: Option<i64>,
}

impl InfoUpdate {
    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            check_length(name, MAX_NAME_LENGTH).map_err(MetadataError::NameTooLong)?;
        }
        if let Some(description) = &self.description {
            check_length(description, MAX_DESCRIPTION_LENGTH)
                .map_err(MetadataError::DescriptionTooLong)?;
        }
        if let Some(pic) = &self.profile_picture {
            pic.validate()?;
        }
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn non_zero<T: Copy + Default + PartialEq>(v: T) -> Option<T> {
    if v == T::default() {
        None
    } else {
        Some(v)
    }
}

// ---------------------------------------------------------------------------
// GroupMetadata
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct GroupMetadata {
    store: ConfigStore<InfoState>,
}

impl GroupMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dump(data: &[u8]) -> Result<Self> {
        Ok(GroupMetadata {
            store: ConfigStore::from_dump(data)?,
        })
    }

    pub fn get(&self) -> GroupInfo {
        let s = self.store.state();
        GroupInfo {
            name: non_empty(s.name.get()),
            description: non_empty(s.description.get()),
            profile_picture: s.profile_pic.get().clone(),
            expiry_seconds: non_zero(*s.expiry_seconds.get()),
            created_at: non_zero(*s.created_at.get()),
            delete_before: non_zero(*s.delete_before.get()),
            delete_attach_before: non_zero(*s.delete_attach_before.get()),
            destroyed: s.destroyed_at.is_some(),
        }
    }

    /// Apply a local edit. Returns true when anything changed.
    pub fn set(&mut self, update: InfoUpdate) -> Result<bool> {
        update.validate()?;
        let (_, changed) = self.store.mutate(|s, ts| {
            if s.destroyed_at.is_some() {
                return Err(MetadataError::Destroyed);
            }
            if let Some(name) = update.name {
                s.name.set(name, ts);
            }
            if let Some(description) = update.description {
                s.description.set(description, ts);
            }
            if let Some(pic) = update.profile_picture {
                s.profile_pic.set(normalize_pic(pic), ts);
            }
            if let Some(expiry) = update.expiry_seconds {
                s.expiry_seconds.set(expiry, ts);
            }
            if let Some(created_at) = update.created_at {
                s.created_at.set(created_at, ts);
            }
            if let Some(before) = update.delete_before {
                s.delete_before.set(before, ts);
            }
            if let Some(before) = update.delete_attach_before {
                s.delete_attach_before.set(before, ts);
            }
            Ok(())
        })?;
        if changed {
            log::debug!("Group info updated at clock {}", self.store.clock());
        }
        Ok(changed)
    }

    /// Tombstone the group. Later edits fail with `Destroyed`.
    pub fn destroy(&mut self) -> Result<bool> {
        let (_, changed) = self.store.mutate(|s, ts| {
            if s.destroyed_at.is_none() {
                s.destroyed_at = Some(ts);
            }
            Ok::<_, MetadataError>(())
        })?;
        if changed {
            log::info!("Group marked destroyed");
        }
        Ok(changed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.store.state().destroyed_at.is_some()
    }

    pub(crate) fn store(&self) -> &ConfigStore<InfoState> {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut ConfigStore<InfoState> {
        &mut self.store
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> InfoUpdate {
        InfoUpdate {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    fn push_payload(meta: &mut GroupMetadata) -> Vec<u8> {
        let (seqno, payload) = meta.store().pending_push().unwrap().unwrap();
        meta.store_mut().confirm_push(seqno);
        payload
    }

    #[test]
    fn test_set_and_get() {
        let mut meta = GroupMetadata::new();
        assert_eq!(meta.get(), GroupInfo::default());

        assert!(meta
            .set(InfoUpdate {
                name: Some("Hikers".into()),
                expiry_seconds: Some(3600),
                profile_picture: Some(ProfilePic::new("https://x/y", vec![1; 32])),
                ..Default::default()
            })
            .unwrap());

        let info = meta.get();
        assert_eq!(info.name.as_deref(), Some("Hikers"));
        assert_eq!(info.expiry_seconds, Some(3600));
        assert_eq!(info.profile_picture.unwrap().url, "https://x/y");
        assert!(info.description.is_none());
    }

    #[test]
    fn test_clear_fields() {
        let mut meta = GroupMetadata::new();
        meta.set(named("Hikers")).unwrap();
        meta.set(InfoUpdate {
            name: Some(String::new()),
            profile_picture: Some(ProfilePic::default()),
            ..Default::default()
        })
        .unwrap();
        assert!(meta.get().name.is_none());
        assert!(meta.get().profile_picture.is_none());
    }

    #[test]
    fn test_validation_rejects_without_partial_apply() {
        let mut meta = GroupMetadata::new();
        let result = meta.set(InfoUpdate {
            name: Some("ok".into()),
            description: Some("d".repeat(MAX_DESCRIPTION_LENGTH + 1)),
            ..Default::default()
        });
        assert!(matches!(result, Err(MetadataError::DescriptionTooLong(_))));
        assert!(meta.get().name.is_none());

        let result = meta.set(InfoUpdate {
            profile_picture: Some(ProfilePic::new("https://x", vec![1; 16])),
            ..Default::default()
        });
        assert_eq!(result, Err(MetadataError::InvalidPictureKey(16)));
    }

    #[test]
    fn test_destroy_blocks_edits() {
        let mut meta = GroupMetadata::new();
        assert!(meta.destroy().unwrap());
        assert!(!meta.destroy().unwrap());
        assert!(meta.get().destroyed);
        assert_eq!(meta.set(named("late")), Err(MetadataError::Destroyed));
    }

    #[test]
    fn test_concurrent_field_edits_both_survive() {
        let mut a = GroupMetadata::new();
        let mut b = GroupMetadata::new();
        a.set(named("From A")).unwrap();
        b.set(InfoUpdate {
            expiry_seconds: Some(60),
            ..Default::default()
        })
        .unwrap();

        let pa = push_payload(&mut a);
        let pb = push_payload(&mut b);
        a.store_mut().merge_payload(&pb).unwrap();
        b.store_mut().merge_payload(&pa).unwrap();

        assert_eq!(a.get(), b.get());
        assert_eq!(a.get().name.as_deref(), Some("From A"));
        assert_eq!(a.get().expiry_seconds, Some(60));
    }

    #[test]
    fn test_merge_commutative() {
        let mut a = GroupMetadata::new();
        let mut b = GroupMetadata::new();
        a.set(named("Alpha")).unwrap();
        b.set(named("Bravo")).unwrap();
        let pa = push_payload(&mut a);
        let pb = push_payload(&mut b);

        let mut x = GroupMetadata::new();
        x.store_mut().merge_payload(&pa).unwrap();
        x.store_mut().merge_payload(&pb).unwrap();

        let mut y = GroupMetadata::new();
        y.store_mut().merge_payload(&pb).unwrap();
        y.store_mut().merge_payload(&pa).unwrap();

        assert_eq!(x.store().state(), y.store().state());
        // equal clocks: the greater encoding wins
        assert_eq!(x.get().name.as_deref(), Some("Bravo"));
    }

    #[test]
    fn test_newer_write_wins_after_merge() {
        let mut a = GroupMetadata::new();
        let mut b = GroupMetadata::new();
        a.set(named("v1")).unwrap();
        let p1 = push_payload(&mut a);
        b.store_mut().merge_payload(&p1).unwrap();
        b.set(named("v2")).unwrap();
        let p2 = push_payload(&mut b);

        a.store_mut().merge_payload(&p2).unwrap();
        assert_eq!(a.get().name.as_deref(), Some("v2"));
        // stale replay does not regress
        a.store_mut().merge_payload(&p1).unwrap();
        assert_eq!(a.get().name.as_deref(), Some("v2"));
    }

    #[test]
    fn test_destroyed_survives_merge() {
        let mut a = GroupMetadata::new();
        let mut b = GroupMetadata::new();
        a.destroy().unwrap();
        let pa = push_payload(&mut a);
        b.set(named("after")).unwrap();
        b.set(named("after again")).unwrap();
        b.store_mut().merge_payload(&pa).unwrap();
        assert!(b.is_destroyed());
    }

    #[test]
    fn test_clock_survives_dump() {
        let mut meta = GroupMetadata::new();
        meta.set(named("one")).unwrap();
        meta.set(named("two")).unwrap();
        let dump = meta.store_mut().dump().unwrap();

        let mut restored = GroupMetadata::from_dump(&dump).unwrap();
        assert_eq!(restored.store().clock(), 2);
        restored.set(named("three")).unwrap();
        assert_eq!(restored.store().clock(), 3);
    }
}
