/// The user's groups registry: one merged store of communities, legacy
/// groups and groups, synced between the user's own devices.
///
/// Pushes are sealed with a key derived from the user's secret key and
/// signed by the user's Ed25519 key, so only the user's devices can produce
/// or read them.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroize;

use crate::crypto::{self, derive_key, generate_keypair, SymmetricKey};
use crate::identity::{GroupKeys, IdentityError, SessionId, UserKeys};
use crate::store::{
    now_secs, ConfigMessage, ConfigState, ConfigStore, PushEntry, StoreKind,
};
use crate::user_groups::community::{
    build_full_url, normalize_base_url, CommunityInfo, CommunityRecord, CommunityUrl,
};
use crate::user_groups::group::{GroupRecord, GroupStatus, GroupUpdate, UserGroupInfo};
use crate::user_groups::legacy::{LegacyGroupInfo, LegacyRecord};
use crate::user_groups::{BaseGroup, Result, UserGroupEntry, UserGroupsError};

const USER_GROUPS_KEY_INFO: &[u8] = b"conclave-user-groups";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct UserGroupsState {
    /// Keyed by normalized base url + lower-cased room.
    communities: BTreeMap<String, CommunityRecord>,
    legacy_groups: BTreeMap<SessionId, LegacyRecord>,
    groups: BTreeMap<SessionId, GroupRecord>,
}

impl ConfigState for UserGroupsState {
    const KIND: StoreKind = StoreKind::UserGroups;

    fn merge(&mut self, other: &Self) {
        for (key, theirs) in &other.communities {
            match self.communities.get_mut(key) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.communities.insert(key.clone(), theirs.clone());
                }
            }
        }
        for (id, theirs) in &other.legacy_groups {
            match self.legacy_groups.get_mut(id) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.legacy_groups.insert(*id, theirs.clone());
                }
            }
        }
        for (id, theirs) in &other.groups {
            match self.groups.get_mut(id) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.groups.insert(*id, theirs.clone());
                }
            }
        }
    }
}

/// Highest priority first, then by key.
fn sort_by_priority<T>(items: &mut [T], base: impl Fn(&T) -> &BaseGroup, key: impl Fn(&T) -> String) {
    items.sort_by(|a, b| {
        base(b)
            .priority
            .cmp(&base(a).priority)
            .then_with(|| key(a).cmp(&key(b)))
    });
}

fn require_group_id(id: &SessionId) -> Result<()> {
    if id.is_group() {
        Ok(())
    } else {
        Err(IdentityError::WrongKind { expected: "group" }.into())
    }
}

// ---------------------------------------------------------------------------
// UserGroupsRegistry
// ---------------------------------------------------------------------------

pub struct UserGroupsRegistry {
    user: UserKeys,
    key: SymmetricKey,
    store: ConfigStore<UserGroupsState>,
}

impl UserGroupsRegistry {
    /// Open the registry of the user owning `user_secret_key` (64 bytes).
    pub fn init(user_secret_key: &[u8], dump: Option<&[u8]>) -> Result<Self> {
        let user = UserKeys::from_secret_key(user_secret_key)?;
        let key = derive_key(
            user.ed25519_seed(),
            None,
            &[USER_GROUPS_KEY_INFO, &user.ed25519_public()[..]],
        )?;
        let store = match dump {
            Some(data) => ConfigStore::from_dump(data)?,
            None => ConfigStore::new(),
        };
        log::debug!("Opened user groups registry for {:?}", user.session_id());
        Ok(UserGroupsRegistry { user, key, store })
    }

    // -----------------------------------------------------------------------
    // Communities
    // -----------------------------------------------------------------------

    /// Look up a community; the url may omit the public key.
    pub fn get_community_by_full_url(&self, full_url: &str) -> Result<Option<CommunityInfo>> {
        let url = CommunityUrl::parse(full_url)?;
        Ok(self
            .store
            .state()
            .communities
            .get(&url.key())
            .filter(|r| r.base.is_live())
            .map(CommunityRecord::view))
    }

    /// Add or update a community. The url must carry the public key.
    ///
    /// Every spelling of the same base url and room lands on one record.
    pub fn set_community_by_full_url(&mut self, full_url: &str, priority: i64) -> Result<bool> {
        let url = CommunityUrl::parse(full_url)?;
        let pubkey = url.pubkey.ok_or(UserGroupsError::MissingPubkey)?;
        let key = url.key();
        let (_, changed) = self.store.mutate(|s, ts| {
            let record = s
                .communities
                .entry(key.clone())
                .or_insert_with(|| CommunityRecord::new(&url.base_url));
            record.write(&url, pubkey, priority, ts);
            Ok::<_, UserGroupsError>(())
        })?;
        if changed {
            log::debug!("Community {} updated", key);
        }
        Ok(changed)
    }

    pub fn get_all_communities(&self) -> Vec<CommunityInfo> {
        let mut all: Vec<CommunityInfo> = self
            .store
            .state()
            .communities
            .values()
            .filter(|r| r.base.is_live())
            .map(CommunityRecord::view)
            .collect();
        sort_by_priority(&mut all, |c| &c.base, CommunityInfo::key);
        all
    }

    pub fn erase_community_by_full_url(&mut self, full_url: &str) -> Result<bool> {
        let key = CommunityUrl::parse(full_url)?.key();
        self.erase_with(|s, ts| match s.communities.get_mut(&key) {
            Some(r) if r.base.is_live() => {
                r.base.erase(ts);
                true
            }
            _ => false,
        })
    }

    /// `<base>/<room>?public_key=<hex>` from its parts.
    pub fn build_full_url_from_details(
        &self,
        base_url: &str,
        room: &str,
        pubkey_hex: &str,
    ) -> Result<String> {
        let base = normalize_base_url(base_url)?;
        let bytes = hex::decode(pubkey_hex).map_err(|_| UserGroupsError::InvalidPubkey)?;
        let pubkey: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| UserGroupsError::InvalidPubkey)?;
        let full = build_full_url(&base, room, &pubkey);
        // reject rooms the parser would not accept back
        CommunityUrl::parse(&full)?;
        Ok(full)
    }

    // -----------------------------------------------------------------------
    // Legacy groups
    // -----------------------------------------------------------------------

    pub fn get_legacy_group(&self, id: &SessionId) -> Option<LegacyGroupInfo> {
        self.store
            .state()
            .legacy_groups
            .get(id)
            .filter(|r| r.base.is_live())
            .map(|r| r.view(*id))
    }

    pub fn get_all_legacy_groups(&self) -> Vec<LegacyGroupInfo> {
        let mut all: Vec<LegacyGroupInfo> = self
            .store
            .state()
            .legacy_groups
            .iter()
            .filter(|(_, r)| r.base.is_live())
            .map(|(id, r)| r.view(*id))
            .collect();
        sort_by_priority(&mut all, |l| &l.base, |l| l.session_id.to_hex());
        all
    }

    /// Store `info` as the group's full state. Returns true when anything
    /// changed.
    pub fn set_legacy_group(&mut self, info: &LegacyGroupInfo) -> Result<bool> {
        info.validate()?;
        let (_, changed) = self.store.mutate(|s, ts| {
            let record = s.legacy_groups.entry(info.session_id).or_default();
            record.write(info, ts);
            Ok::<_, UserGroupsError>(())
        })?;
        Ok(changed)
    }

    pub fn erase_legacy_group(&mut self, id: &SessionId) -> Result<bool> {
        self.erase_with(|s, ts| match s.legacy_groups.get_mut(id) {
            Some(r) if r.base.is_live() => {
                r.base.erase(ts);
                true
            }
            _ => false,
        })
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// Generate a new group key pair and record the group as joined.
    ///
    /// The returned view always carries the new secret key.
    pub fn create_group(&mut self) -> Result<UserGroupInfo> {
        let (public, mut secret) = generate_keypair();
        let id = SessionId::group(&public);
        let update = GroupUpdate {
            secret_key: Some(secret.to_vec()),
            joined_at_seconds: Some(now_secs()),
            ..Default::default()
        };
        secret.zeroize();

        self.store.mutate(|s, ts| {
            s.groups.entry(id).or_default().apply(&update, ts);
            Ok::<_, UserGroupsError>(())
        })?;
        log::info!("Created group {:?}", id);
        self.get_group(&id).ok_or(UserGroupsError::GroupNotFound)
    }

    pub fn get_group(&self, id: &SessionId) -> Option<UserGroupInfo> {
        self.store
            .state()
            .groups
            .get(id)
            .filter(|r| r.base.is_live())
            .map(|r| r.view(*id))
    }

    pub fn get_all_groups(&self) -> Vec<UserGroupInfo> {
        let mut all: Vec<UserGroupInfo> = self
            .store
            .state()
            .groups
            .iter()
            .filter(|(_, r)| r.base.is_live())
            .map(|(id, r)| r.view(*id))
            .collect();
        sort_by_priority(&mut all, |g| &g.base, |g| g.session_id.to_hex());
        all
    }

    /// Create or update a group. Kicked and destroyed groups are frozen.
    pub fn set_group(&mut self, id: &SessionId, update: GroupUpdate) -> Result<UserGroupInfo> {
        require_group_id(id)?;
        update.validate()?;
        if let Some(secret) = update.secret_key.as_deref().filter(|k| !k.is_empty()) {
            GroupKeys::new(&id.pubkey(), Some(secret))?;
        }

        self.store.mutate(|s, ts| {
            let record = s.groups.entry(*id).or_default();
            let destroyed = record.status() == GroupStatus::Destroyed;
            if destroyed || (record.base.is_live() && record.is_terminated()) {
                return Err(UserGroupsError::GroupTerminated);
            }
            record.apply(&update, ts);
            Ok(())
        })?;
        self.get_group(id).ok_or(UserGroupsError::GroupNotFound)
    }

    /// We were removed from the group: forget its credentials.
    pub fn mark_group_kicked(&mut self, id: &SessionId) -> Result<UserGroupInfo> {
        self.mark(id, GroupStatus::Kicked)
    }

    /// The group was destroyed. Final: later invites are refused.
    pub fn mark_group_destroyed(&mut self, id: &SessionId) -> Result<UserGroupInfo> {
        self.mark(id, GroupStatus::Destroyed)
    }

    /// An invite arrived; creates the group if unknown, lifts a kick.
    pub fn mark_group_invited(&mut self, id: &SessionId) -> Result<UserGroupInfo> {
        require_group_id(id)?;
        self.store.mutate(|s, ts| {
            let record = s.groups.entry(*id).or_default();
            if record.status() == GroupStatus::Destroyed {
                return Err(UserGroupsError::GroupTerminated);
            }
            record.apply(
                &GroupUpdate {
                    invite_pending: Some(true),
                    ..Default::default()
                },
                ts,
            );
            Ok(())
        })?;
        log::debug!("Group {:?} invite pending", id);
        self.get_group(id).ok_or(UserGroupsError::GroupNotFound)
    }

    fn mark(&mut self, id: &SessionId, status: GroupStatus) -> Result<UserGroupInfo> {
        require_group_id(id)?;
        let (_, changed) = self.store.mutate(|s, ts| {
            let record = s
                .groups
                .get_mut(id)
                .filter(|r| r.base.is_live())
                .ok_or(UserGroupsError::GroupNotFound)?;
            let moved = record.set_status(status, ts);
            let dropped = record.drop_credentials(ts);
            if moved || dropped {
                record.base.touch(ts);
            }
            Ok::<_, UserGroupsError>(())
        })?;
        if changed {
            log::info!("Group {:?} marked {:?}", id, status);
        }
        self.get_group(id).ok_or(UserGroupsError::GroupNotFound)
    }

    pub fn erase_group(&mut self, id: &SessionId) -> Result<bool> {
        self.erase_with(|s, ts| match s.groups.get_mut(id) {
            Some(r) if r.base.is_live() => {
                r.base.erase(ts);
                true
            }
            _ => false,
        })
    }

    // -----------------------------------------------------------------------
    // All entries
    // -----------------------------------------------------------------------

    /// Every live entry, highest priority first, then by key.
    pub fn get_all(&self) -> Vec<UserGroupEntry> {
        let mut all: Vec<UserGroupEntry> = self
            .get_all_communities()
            .into_iter()
            .map(UserGroupEntry::Community)
            .chain(
                self.get_all_legacy_groups()
                    .into_iter()
                    .map(UserGroupEntry::LegacyGroup),
            )
            .chain(self.get_all_groups().into_iter().map(UserGroupEntry::Group))
            .collect();
        sort_by_priority(&mut all, UserGroupEntry::base, UserGroupEntry::key);
        all
    }

    fn erase_with<F>(&mut self, erase: F) -> Result<bool>
    where
        F: FnOnce(&mut UserGroupsState, u64) -> bool,
    {
        let (erased, _) = self
            .store
            .mutate(|s, ts| Ok::<_, UserGroupsError>(erase(s, ts)))?;
        Ok(erased)
    }

    // -----------------------------------------------------------------------
    // Push / merge / dump
    // -----------------------------------------------------------------------

    pub fn needs_push(&self) -> bool {
        self.store.needs_push()
    }

    /// The sealed state to send to the user's other devices, if dirty.
    pub fn push(&mut self) -> Result<Option<PushEntry>> {
        let (seqno, payload) = match self.store.pending_push()? {
            Some(pending) => pending,
            None => return Ok(None),
        };
        let data = ConfigMessage::seal(
            StoreKind::UserGroups,
            seqno,
            &payload,
            &self.key,
            self.user.ed25519_seed(),
            self.user.ed25519_public(),
        )?;
        self.store.confirm_push(seqno);
        log::debug!("User groups push seqno {}", seqno);
        Ok(Some(PushEntry {
            kind: StoreKind::UserGroups,
            seqno,
            data,
        }))
    }

    /// Merge a push from another of the user's devices.
    pub fn merge(&mut self, data: &[u8]) -> Result<bool> {
        let me = self.user.ed25519_public();
        let key = &self.key;
        let (_, payload) = ConfigMessage::open(data, StoreKind::UserGroups, me, me, |ct, ad| {
            crypto::decrypt(ct, key, ad).ok()
        })?;
        Ok(self.store.merge_payload(&payload)?)
    }

    pub fn needs_dump(&self) -> bool {
        self.store.needs_dump()
    }

    pub fn dump(&mut self) -> Result<Vec<u8>> {
        Ok(self.store.dump()?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
