/// GroupConfig: one group's metadata, roster and key ring behind a single
/// push / dump / merge surface.
///
/// Push order is keys first, then info, then members, so a receiver always
/// has the key a config message was sealed with by the time it arrives.
/// Info and member pushes are sealed with the current group key and signed
/// by the group secret key; only admin instances can produce them.
use thiserror::Error;

use crate::groups::info::{GroupInfo, GroupMetadata, InfoUpdate, MetadataError, ProfilePic};
use crate::groups::keys::{
    DecryptedMessage, KeyInfo, KeyLoadOutcome, KeyRetention, KeyRing, KeyRingError,
};
use crate::groups::members::{Member, MembershipError, MembershipRoster};
use crate::identity::{GroupKeys, IdentityError, SessionId, UserKeys};
use crate::store::{
    ConfigMessage, ConfigState, ConfigStore, DumpEntry, PushEntry, StoreError, StoreKind,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GroupConfigError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Key ring error: {0}")]
    Keys(#[from] KeyRingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Group config is read-only without the group secret key")]
    ReadOnly,

    #[error("Store kind {0:?} cannot be merged here")]
    UnsupportedKind(StoreKind),
}

pub type Result<T> = std::result::Result<T, GroupConfigError>;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Persisted blobs to restore from. Missing entries start fresh.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupDumps<'a> {
    pub info: Option<&'a [u8]>,
    pub members: Option<&'a [u8]>,
    pub keys: Option<&'a [u8]>,
}

impl<'a> GroupDumps<'a> {
    /// Pick the group blobs out of a dump batch.
    pub fn from_entries(entries: &'a [DumpEntry]) -> Self {
        let mut dumps = GroupDumps::default();
        for entry in entries {
            match entry.kind {
                StoreKind::GroupInfo => dumps.info = Some(&entry.data),
                StoreKind::GroupMembers => dumps.members = Some(&entry.data),
                StoreKind::GroupKeys => dumps.keys = Some(&entry.data),
                StoreKind::UserGroups => {}
            }
        }
        dumps
    }
}

/// Runtime tunables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupConfigOptions {
    pub key_retention: KeyRetention,
}

// ---------------------------------------------------------------------------
// GroupConfig
// ---------------------------------------------------------------------------

pub struct GroupConfig {
    user: UserKeys,
    group: GroupKeys,
    info: GroupMetadata,
    members: MembershipRoster,
    keys: KeyRing,
}

impl GroupConfig {
    /// Open a group with default options.
    ///
    /// # Arguments
    /// * `user_secret_key` - 64-byte Ed25519 secret key of the local user
    /// * `group_public_key` - 32-byte Ed25519 public key of the group
    /// * `group_secret_key` - 64-byte group secret key, admins only
    /// * `dumps` - previously persisted blobs
    pub fn init(
        user_secret_key: &[u8],
        group_public_key: &[u8],
        group_secret_key: Option<&[u8]>,
        dumps: GroupDumps<'_>,
    ) -> Result<Self> {
        Self::init_with_options(
            user_secret_key,
            group_public_key,
            group_secret_key,
            dumps,
            GroupConfigOptions::default(),
        )
    }

    pub fn init_with_options(
        user_secret_key: &[u8],
        group_public_key: &[u8],
        group_secret_key: Option<&[u8]>,
        dumps: GroupDumps<'_>,
        options: GroupConfigOptions,
    ) -> Result<Self> {
        let user = UserKeys::from_secret_key(user_secret_key)?;
        let group = GroupKeys::new(group_public_key, group_secret_key)?;

        let mut info = match dumps.info {
            Some(data) => GroupMetadata::from_dump(data)?,
            None => GroupMetadata::new(),
        };
        let mut members = match dumps.members {
            Some(data) => MembershipRoster::from_dump(data)?,
            None => MembershipRoster::new(),
        };
        let keys = match dumps.keys {
            Some(data) => KeyRing::from_dump(*group.public(), data, options.key_retention)?,
            None => KeyRing::new(*group.public(), options.key_retention),
        };

        let admin = group.is_admin();
        info.store_mut().set_read_only(!admin);
        members.store_mut().set_read_only(!admin);

        let mut config = GroupConfig {
            user,
            group,
            info,
            members,
            keys,
        };
        // the key dump may predate the roster dump
        for member in config.members.get_all() {
            if member.status.is_removed() {
                config.keys.note_member_removed(&member.session_id);
            }
        }

        if admin && config.keys.is_empty() {
            config.keys_rekey()?;
        }

        log::info!(
            "Opened group {:?} (admin={}, generation={:?})",
            config.group.session_id(),
            admin,
            config.keys.generation()
        );
        Ok(config)
    }

    /// The group's `03` session id.
    pub fn session_id(&self) -> SessionId {
        self.group.session_id()
    }

    pub fn is_admin(&self) -> bool {
        self.group.is_admin()
    }

    fn require_admin(&self) -> Result<()> {
        if self.group.is_admin() {
            Ok(())
        } else {
            Err(GroupConfigError::ReadOnly)
        }
    }

    // -----------------------------------------------------------------------
    // Info
    // -----------------------------------------------------------------------

    pub fn info_get(&self) -> GroupInfo {
        self.info.get()
    }

    pub fn info_set(&mut self, update: InfoUpdate) -> Result<bool> {
        self.require_admin()?;
        Ok(self.info.set(update)?)
    }

    pub fn info_destroy(&mut self) -> Result<bool> {
        self.require_admin()?;
        Ok(self.info.destroy()?)
    }

    // -----------------------------------------------------------------------
    // Members
    // -----------------------------------------------------------------------

    pub fn member_get(&self, id: &SessionId) -> Option<Member> {
        self.members.get(id)
    }

    pub fn member_get_or_construct(&mut self, id: &SessionId) -> Result<Member> {
        if let Some(member) = self.members.get(id) {
            return Ok(member);
        }
        self.require_admin()?;
        Ok(self.members.get_or_construct(id)?)
    }

    pub fn member_get_all(&self) -> Vec<Member> {
        self.members.get_all()
    }

    pub fn member_set_invited(&mut self, id: &SessionId, failed: bool) -> Result<bool> {
        self.require_admin()?;
        Ok(self.members.set_invited(id, failed)?)
    }

    pub fn member_set_accepted(&mut self, id: &SessionId) -> Result<bool> {
        self.require_admin()?;
        Ok(self.members.set_accepted(id)?)
    }

    pub fn member_set_promoted(&mut self, id: &SessionId, failed: bool) -> Result<bool> {
        self.require_admin()?;
        Ok(self.members.set_promoted(id, failed)?)
    }

    pub fn member_set_name(&mut self, id: &SessionId, name: &str) -> Result<bool> {
        self.require_admin()?;
        Ok(self.members.set_name(id, name)?)
    }

    pub fn member_set_profile_picture(&mut self, id: &SessionId, pic: ProfilePic) -> Result<bool> {
        self.require_admin()?;
        Ok(self.members.set_profile_picture(id, pic)?)
    }

    /// Remove a member. The next push rotates the group key.
    pub fn member_erase(&mut self, id: &SessionId) -> Result<bool> {
        self.require_admin()?;
        let changed = self.members.erase(id)?;
        if changed {
            self.keys.note_member_removed(id);
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    pub fn keys_needs_rekey(&self) -> bool {
        self.keys.needs_rekey(&self.group)
    }

    /// Rotate to a new generation for every current key holder.
    pub fn keys_rekey(&mut self) -> Result<Vec<u8>> {
        let recipients = self.members.key_holders();
        Ok(self.keys.rekey(&self.group, &recipients)?)
    }

    /// Hand all retained keys to `members` without rotating.
    pub fn keys_supplement(&mut self, members: &[SessionId]) -> Result<Vec<u8>> {
        Ok(self.keys.supplement(&self.group, members)?)
    }

    pub fn keys_generation(&self) -> Option<u64> {
        self.keys.generation()
    }

    /// Retained keys, newest first.
    pub fn group_keys(&self) -> Vec<KeyInfo> {
        self.keys.group_keys()
    }

    pub fn load_key_message(
        &mut self,
        data: &[u8],
        hash: &str,
        timestamp_ms: u64,
    ) -> Result<KeyLoadOutcome> {
        Ok(self
            .keys
            .load_key_message(&self.user, &self.group, data, hash, timestamp_ms)?)
    }

    pub fn current_hashes(&self) -> Vec<String> {
        self.keys.current_hashes()
    }

    pub fn encrypt_message(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.keys.encrypt_message(&self.user, plaintext)?)
    }

    pub fn decrypt_message(&self, data: &[u8]) -> Result<DecryptedMessage> {
        Ok(self.keys.decrypt_message(data)?)
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    pub fn needs_push(&self) -> bool {
        self.keys.needs_push()
            || self.info.store().needs_push()
            || self.members.store().needs_push()
            || self.keys_needs_rekey()
    }

    /// Everything other writers have not seen yet. Clears the push flags;
    /// calling again without changes returns an empty batch.
    pub fn push(&mut self) -> Result<Vec<PushEntry>> {
        if self.keys_needs_rekey() {
            self.keys_rekey()?;
        }

        let keys_entry = self.keys.pending_push().map(|(seqno, data)| PushEntry {
            kind: StoreKind::GroupKeys,
            seqno,
            data,
        });
        let info_entry = self.seal_pending(self.info.store())?;
        let members_entry = self.seal_pending(self.members.store())?;

        let mut batch = Vec::new();
        if let Some(entry) = keys_entry {
            self.keys.confirm_push(entry.seqno);
            batch.push(entry);
        }
        if let Some(entry) = info_entry {
            self.info.store_mut().confirm_push(entry.seqno);
            batch.push(entry);
        }
        if let Some(entry) = members_entry {
            self.members.store_mut().confirm_push(entry.seqno);
            batch.push(entry);
        }

        if !batch.is_empty() {
            log::debug!(
                "Push for {:?}: {:?}",
                self.group.session_id(),
                batch.iter().map(|e| (e.kind, e.seqno)).collect::<Vec<_>>()
            );
        }
        Ok(batch)
    }

    fn seal_pending<S: ConfigState>(&self, store: &ConfigStore<S>) -> Result<Option<PushEntry>> {
        let (seqno, payload) = match store.pending_push()? {
            Some(pending) => pending,
            None => return Ok(None),
        };
        let seed = self.group.seed().ok_or(GroupConfigError::ReadOnly)?;
        let key = self.keys.current_key().ok_or(KeyRingError::NoKeys)?;
        let data = ConfigMessage::seal(S::KIND, seqno, &payload, key, seed, self.group.public())?;
        Ok(Some(PushEntry {
            kind: S::KIND,
            seqno,
            data,
        }))
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Ingest an info or members message pushed by another admin.
    ///
    /// Returns true when the merged state changed. Key messages go through
    /// [`GroupConfig::load_key_message`] instead.
    pub fn merge(&mut self, kind: StoreKind, data: &[u8]) -> Result<bool> {
        match kind {
            StoreKind::GroupInfo => {
                let payload = self.open(kind, data)?;
                Ok(self.info.store_mut().merge_payload(&payload)?)
            }
            StoreKind::GroupMembers => {
                let payload = self.open(kind, data)?;
                let merged = self.members.merge_payload(&payload)?;
                for (id, _) in &merged.newly_removed {
                    self.keys.note_member_removed(id);
                }
                Ok(merged.changed)
            }
            other => Err(GroupConfigError::UnsupportedKind(other)),
        }
    }

    fn open(&self, kind: StoreKind, data: &[u8]) -> Result<Vec<u8>> {
        let group = self.group.public();
        let (_, payload) = ConfigMessage::open(data, kind, group, group, |ciphertext, ad| {
            self.keys.try_decrypt(ciphertext, ad)
        })?;
        Ok(payload)
    }

    // -----------------------------------------------------------------------
    // Dump
    // -----------------------------------------------------------------------

    pub fn needs_dump(&self) -> bool {
        self.info.store().needs_dump()
            || self.members.store().needs_dump()
            || self.keys.needs_dump()
    }

    /// Snapshots of the stores with unsaved changes. Clears the dump flags.
    pub fn dump(&mut self) -> Result<Vec<DumpEntry>> {
        let mut entries = Vec::new();
        if self.info.store().needs_dump() {
            entries.push(DumpEntry {
                kind: StoreKind::GroupInfo,
                data: self.info.store_mut().dump()?,
            });
        }
        if self.members.store().needs_dump() {
            entries.push(DumpEntry {
                kind: StoreKind::GroupMembers,
                data: self.members.store_mut().dump()?,
            });
        }
        if self.keys.needs_dump() {
            entries.push(DumpEntry {
                kind: StoreKind::GroupKeys,
                data: self.keys.dump()?,
            });
        }
        Ok(entries)
    }

    /// Snapshots of all three stores, dirty or not. Clears the dump flags.
    pub fn dump_all(&mut self) -> Result<Vec<DumpEntry>> {
        Ok(vec![
            DumpEntry {
                kind: StoreKind::GroupInfo,
                data: self.info.store_mut().dump()?,
            },
            DumpEntry {
                kind: StoreKind::GroupMembers,
                data: self.members.store_mut().dump()?,
            },
            DumpEntry {
                kind: StoreKind::GroupKeys,
                data: self.keys.dump()?,
            },
        ])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
