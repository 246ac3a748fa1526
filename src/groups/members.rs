/// Membership roster, merged across admins.
///
/// Keyed by member session id (`05` prefix). Name and picture are LWW
/// registers. Status is an authority-tiered register: a merge can only move
/// a member up the ladder
///
///   InviteSent / InviteFailed < Accepted < PromotionFailed < Promoted
///     < RemovedUnknown < Removed
///
/// so clock skew can never un-remove or un-promote anyone. Removed members
/// stay in the map as tombstones; absence means "never known".
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::groups::info::{normalize_pic, MetadataError, ProfilePic};
use crate::identity::SessionId;
use crate::limits::{check_length, MAX_NAME_LENGTH};
use crate::store::{Authority, ConfigState, ConfigStore, Lww, StoreError, StoreKind, Tiered};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Members must be addressed by a user (05) session id")]
    NotAUser,

    #[error("Member not found")]
    MemberNotFound,

    #[error("Member has been removed")]
    MemberRemoved,

    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: Option<MemberStatus>,
        to: MemberStatus,
    },

    #[error("Name too long ({0} bytes)")]
    NameTooLong(usize),

    #[error("Invalid profile picture: {0}")]
    InvalidPicture(MetadataError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, MembershipError>;

// ---------------------------------------------------------------------------
// MemberStatus
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MemberStatus {
    #[default]
    InviteSent = 0,
    InviteFailed = 1,
    Accepted = 2,
    PromotionFailed = 3,
    Promoted = 4,
    RemovedUnknown = 5,
    Removed = 6,
}

impl Authority for MemberStatus {
    fn tier(&self) -> u8 {
        match self {
            MemberStatus::InviteSent | MemberStatus::InviteFailed => 1,
            MemberStatus::Accepted => 2,
            MemberStatus::PromotionFailed => 3,
            MemberStatus::Promoted => 4,
            MemberStatus::RemovedUnknown => 5,
            MemberStatus::Removed => 6,
        }
    }

    fn code(&self) -> u8 {
        *self as u8
    }
}

impl MemberStatus {
    pub fn is_removed(&self) -> bool {
        matches!(self, MemberStatus::Removed | MemberStatus::RemovedUnknown)
    }

    pub fn is_invite_pending(&self) -> bool {
        matches!(self, MemberStatus::InviteSent | MemberStatus::InviteFailed)
    }

    /// Members in these states are handed the group keys on every rekey.
    pub fn holds_keys(&self) -> bool {
        matches!(
            self,
            MemberStatus::Accepted | MemberStatus::PromotionFailed | MemberStatus::Promoted
        )
    }

    /// Whether a local edit may move a member from `from` to `to`.
    pub fn can_transition(from: Option<MemberStatus>, to: MemberStatus) -> bool {
        use MemberStatus::*;
        match (from, to) {
            (None, InviteSent | InviteFailed | Accepted) => true,
            (Some(InviteSent | InviteFailed), InviteSent | InviteFailed | Accepted | Removed) => {
                true
            }
            (Some(Accepted), PromotionFailed | Promoted | Removed) => true,
            (Some(PromotionFailed), Promoted | Removed) => true,
            (Some(Promoted), Removed) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Records and views
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MemberRecord {
    name: Lww<String>,
    profile_pic: Lww<Option<ProfilePic>>,
    status: Tiered<MemberStatus>,
}

impl MemberRecord {
    fn with_status(status: MemberStatus, ts: u64) -> Self {
        MemberRecord {
            name: Lww::default(),
            profile_pic: Lww::default(),
            status: Tiered::new(status, ts),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.name.merge(&other.name);
        self.profile_pic.merge(&other.profile_pic);
        self.status.merge(&other.status);
    }
}

/// Merged view of one member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub session_id: SessionId,
    pub name: Option<String>,
    pub profile_picture: Option<ProfilePic>,
    pub status: MemberStatus,
}

impl Member {
    fn from_record(session_id: SessionId, record: &MemberRecord) -> Self {
        let name = record.name.get();
        Member {
            session_id,
            name: if name.is_empty() {
                None
            } else {
                Some(name.clone())
            },
            profile_picture: record.profile_pic.get().clone(),
            status: *record.status.get(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.status == MemberStatus::Promoted
    }

    pub fn is_removed(&self) -> bool {
        self.status.is_removed()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RosterState {
    members: BTreeMap<SessionId, MemberRecord>,
}

impl ConfigState for RosterState {
    const KIND: StoreKind = StoreKind::GroupMembers;

    fn merge(&mut self, other: &Self) {
        for (id, theirs) in &other.members {
            match self.members.get_mut(id) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.members.insert(*id, theirs.clone());
                }
            }
        }
    }
}

/// What a roster merge did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RosterMerge {
    pub changed: bool,
    /// Members that became removed in this merge, with the lamport
    /// timestamp of their removal.
    pub newly_removed: Vec<(SessionId, u64)>,
}

// ---------------------------------------------------------------------------
// MembershipRoster
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct MembershipRoster {
    store: ConfigStore<RosterState>,
}

impl MembershipRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dump(data: &[u8]) -> Result<Self> {
        Ok(MembershipRoster {
            store: ConfigStore::from_dump(data)?,
        })
    }

    pub fn get(&self, id: &SessionId) -> Option<Member> {
        self.store
            .state()
            .members
            .get(id)
            .map(|r| Member::from_record(*id, r))
    }

    /// Existing member, or a new one in `InviteSent`.
    pub fn get_or_construct(&mut self, id: &SessionId) -> Result<Member> {
        if let Some(member) = self.get(id) {
            return Ok(member);
        }
        self.transition(id, MemberStatus::InviteSent)?;
        self.get(id).ok_or(MembershipError::MemberNotFound)
    }

    /// Every known member, removed ones included, ordered by session id.
    pub fn get_all(&self) -> Vec<Member> {
        self.store
            .state()
            .members
            .iter()
            .map(|(id, r)| Member::from_record(*id, r))
            .collect()
    }

    /// Members that should receive the group keys.
    pub fn key_holders(&self) -> Vec<SessionId> {
        self.store
            .state()
            .members
            .iter()
            .filter(|(_, r)| r.status.get().holds_keys())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn set_invited(&mut self, id: &SessionId, failed: bool) -> Result<bool> {
        let to = if failed {
            MemberStatus::InviteFailed
        } else {
            MemberStatus::InviteSent
        };
        self.transition(id, to)
    }

    pub fn set_accepted(&mut self, id: &SessionId) -> Result<bool> {
        self.transition(id, MemberStatus::Accepted)
    }

    pub fn set_promoted(&mut self, id: &SessionId, failed: bool) -> Result<bool> {
        let to = if failed {
            MemberStatus::PromotionFailed
        } else {
            MemberStatus::Promoted
        };
        self.transition(id, to)
    }

    pub fn set_name(&mut self, id: &SessionId, name: &str) -> Result<bool> {
        check_length(name, MAX_NAME_LENGTH).map_err(MembershipError::NameTooLong)?;
        self.edit_live(id, |record, ts| record.name.set(name.to_string(), ts))
    }

    pub fn set_profile_picture(&mut self, id: &SessionId, pic: ProfilePic) -> Result<bool> {
        pic.validate().map_err(MembershipError::InvalidPicture)?;
        self.edit_live(id, move |record, ts| {
            record.profile_pic.set(normalize_pic(pic), ts)
        })
    }

    /// Remove a member. Erasing a key that was never seen leaves a
    /// `RemovedUnknown` tombstone so a late invite cannot bring it back.
    ///
    /// Returns false if the member was already removed.
    pub fn erase(&mut self, id: &SessionId) -> Result<bool> {
        if !id.is_user() {
            return Err(MembershipError::NotAUser);
        }
        let (_, changed) = self.store.mutate(|s, ts| {
            match s.members.get_mut(id) {
                Some(record) if record.status.get().is_removed() => {}
                Some(record) => {
                    record.status.set(MemberStatus::Removed, ts);
                }
                None => {
                    s.members
                        .insert(*id, MemberRecord::with_status(MemberStatus::RemovedUnknown, ts));
                }
            }
            Ok::<_, MembershipError>(())
        })?;
        if changed {
            log::info!("Member {:?} removed", id);
        }
        Ok(changed)
    }

    /// Merge a pushed roster from another admin.
    pub fn merge_payload(&mut self, payload: &[u8]) -> Result<RosterMerge> {
        let before: BTreeMap<SessionId, MemberStatus> = self
            .store
            .state()
            .members
            .iter()
            .map(|(id, r)| (*id, *r.status.get()))
            .collect();

        let changed = self.store.merge_payload(payload)?;

        let newly_removed: Vec<(SessionId, u64)> = self
            .store
            .state()
            .members
            .iter()
            .filter(|(id, r)| {
                r.status.get().is_removed()
                    && !before.get(*id).map(|s| s.is_removed()).unwrap_or(false)
            })
            .map(|(id, r)| (*id, r.status.ts()))
            .collect();

        for (id, _) in &newly_removed {
            log::info!("Member {:?} removed by merge", id);
        }
        Ok(RosterMerge {
            changed,
            newly_removed,
        })
    }

    pub(crate) fn store(&self) -> &ConfigStore<RosterState> {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut ConfigStore<RosterState> {
        &mut self.store
    }

    fn transition(&mut self, id: &SessionId, to: MemberStatus) -> Result<bool> {
        if !id.is_user() {
            return Err(MembershipError::NotAUser);
        }
        let (_, changed) = self.store.mutate(|s, ts| {
            let from = s.members.get(id).map(|r| *r.status.get());
            if from == Some(to) {
                return Ok(());
            }
            if !MemberStatus::can_transition(from, to) {
                return Err(MembershipError::InvalidTransition { from, to });
            }
            match s.members.get_mut(id) {
                Some(record) => {
                    record.status.set(to, ts);
                }
                None => {
                    s.members.insert(*id, MemberRecord::with_status(to, ts));
                }
            }
            Ok(())
        })?;
        if changed {
            log::debug!("Member {:?} -> {:?}", id, to);
        }
        Ok(changed)
    }

    fn edit_live<F>(&mut self, id: &SessionId, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut MemberRecord, u64) -> bool,
    {
        let (_, changed) = self.store.mutate(|s, ts| {
            let record = s
                .members
                .get_mut(id)
                .ok_or(MembershipError::MemberNotFound)?;
            if record.status.get().is_removed() {
                return Err(MembershipError::MemberRemoved);
            }
            edit(record, ts);
            Ok(())
        })?;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> SessionId {
        SessionId::user(&[n; 32])
    }

    fn push_payload(roster: &mut MembershipRoster) -> Vec<u8> {
        let (seqno, payload) = roster.store().pending_push().unwrap().unwrap();
        roster.store_mut().confirm_push(seqno);
        payload
    }

    #[test]
    fn test_get_or_construct_creates_invite_sent() {
        let mut roster = MembershipRoster::new();
        assert!(roster.get(&user(1)).is_none());
        let member = roster.get_or_construct(&user(1)).unwrap();
        assert_eq!(member.status, MemberStatus::InviteSent);
        assert_eq!(roster.get_all().len(), 1);
    }

    #[test]
    fn test_get_or_construct_returns_existing() {
        let mut roster = MembershipRoster::new();
        roster.set_accepted(&user(1)).unwrap();
        let member = roster.get_or_construct(&user(1)).unwrap();
        assert_eq!(member.status, MemberStatus::Accepted);
    }

    #[test]
    fn test_group_id_rejected() {
        let mut roster = MembershipRoster::new();
        let group = SessionId::group(&[1; 32]);
        assert_eq!(
            roster.get_or_construct(&group),
            Err(MembershipError::NotAUser)
        );
    }

    #[test]
    fn test_lifecycle() {
        let mut roster = MembershipRoster::new();
        let b = user(2);
        roster.set_invited(&b, false).unwrap();
        roster.set_invited(&b, true).unwrap();
        assert_eq!(roster.get(&b).unwrap().status, MemberStatus::InviteFailed);
        roster.set_invited(&b, false).unwrap();
        roster.set_accepted(&b).unwrap();
        roster.set_promoted(&b, true).unwrap();
        roster.set_promoted(&b, false).unwrap();
        assert!(roster.get(&b).unwrap().is_admin());
        assert!(roster.erase(&b).unwrap());
        assert_eq!(roster.get(&b).unwrap().status, MemberStatus::Removed);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut roster = MembershipRoster::new();
        let b = user(2);
        assert_eq!(
            roster.set_promoted(&b, false),
            Err(MembershipError::InvalidTransition {
                from: None,
                to: MemberStatus::Promoted
            })
        );

        roster.set_accepted(&b).unwrap();
        roster.set_promoted(&b, false).unwrap();
        // no demotion
        assert!(matches!(
            roster.set_accepted(&b),
            Err(MembershipError::InvalidTransition { .. })
        ));
        assert!(matches!(
            roster.set_invited(&b, false),
            Err(MembershipError::InvalidTransition { .. })
        ));
        assert_eq!(roster.get(&b).unwrap().status, MemberStatus::Promoted);

        roster.erase(&b).unwrap();
        assert!(roster.set_accepted(&b).is_err());
    }

    #[test]
    fn test_same_status_is_noop() {
        let mut roster = MembershipRoster::new();
        roster.set_accepted(&user(1)).unwrap();
        let clock = roster.store().clock();
        assert!(!roster.set_accepted(&user(1)).unwrap());
        assert_eq!(roster.store().clock(), clock);
    }

    #[test]
    fn test_erase_unknown_leaves_tombstone() {
        let mut roster = MembershipRoster::new();
        assert!(roster.erase(&user(9)).unwrap());
        assert_eq!(
            roster.get(&user(9)).unwrap().status,
            MemberStatus::RemovedUnknown
        );
        assert!(!roster.erase(&user(9)).unwrap());
        assert!(roster.set_invited(&user(9), false).is_err());
    }

    #[test]
    fn test_name_and_picture_need_live_member() {
        let mut roster = MembershipRoster::new();
        assert_eq!(
            roster.set_name(&user(1), "Bob"),
            Err(MembershipError::MemberNotFound)
        );
        roster.set_accepted(&user(1)).unwrap();
        roster.set_name(&user(1), "Bob").unwrap();
        roster
            .set_profile_picture(&user(1), ProfilePic::new("https://p", vec![3; 32]))
            .unwrap();
        let member = roster.get(&user(1)).unwrap();
        assert_eq!(member.name.as_deref(), Some("Bob"));
        assert!(member.profile_picture.is_some());

        roster.erase(&user(1)).unwrap();
        assert_eq!(
            roster.set_name(&user(1), "Ghost"),
            Err(MembershipError::MemberRemoved)
        );
    }

    #[test]
    fn test_get_all_ordered_by_session_id() {
        let mut roster = MembershipRoster::new();
        roster.set_accepted(&user(3)).unwrap();
        roster.set_accepted(&user(1)).unwrap();
        roster.set_accepted(&user(2)).unwrap();
        let ids: Vec<SessionId> = roster.get_all().iter().map(|m| m.session_id).collect();
        assert_eq!(ids, vec![user(1), user(2), user(3)]);
    }

    #[test]
    fn test_key_holders() {
        let mut roster = MembershipRoster::new();
        roster.set_invited(&user(1), false).unwrap();
        roster.set_accepted(&user(2)).unwrap();
        roster.set_accepted(&user(3)).unwrap();
        roster.set_promoted(&user(3), false).unwrap();
        roster.set_accepted(&user(4)).unwrap();
        roster.erase(&user(4)).unwrap();
        assert_eq!(roster.key_holders(), vec![user(2), user(3)]);
    }

    #[test]
    fn test_stale_accept_does_not_resurrect() {
        let b = user(2);
        let mut admin = MembershipRoster::new();
        admin.set_invited(&b, false).unwrap();
        admin.set_accepted(&b).unwrap();
        assert_eq!(admin.get_all()[0].status, MemberStatus::Accepted);

        // another admin still believes B is accepted, with a later clock
        let mut other = MembershipRoster::new();
        let stale = push_payload(&mut admin);
        other.merge_payload(&stale).unwrap();
        other.set_name(&b, "Bob").unwrap();
        other.set_name(&b, "Bobby").unwrap();
        let concurrent = push_payload(&mut other);

        admin.erase(&b).unwrap();
        let merged = admin.merge_payload(&concurrent).unwrap();
        assert!(merged.newly_removed.is_empty());
        assert_eq!(admin.get(&b).unwrap().status, MemberStatus::Removed);
        assert_eq!(admin.get(&b).unwrap().name.as_deref(), Some("Bobby"));
    }

    #[test]
    fn test_merge_reports_new_removals() {
        let b = user(2);
        let mut a = MembershipRoster::new();
        let mut other = MembershipRoster::new();
        a.set_accepted(&b).unwrap();
        other.merge_payload(&push_payload(&mut a)).unwrap();

        a.erase(&b).unwrap();
        let removal_ts = a.store().clock();
        let merged = other.merge_payload(&push_payload(&mut a)).unwrap();
        assert!(merged.changed);
        assert_eq!(merged.newly_removed, vec![(b, removal_ts)]);
    }

    #[test]
    fn test_membership_monotonic_under_any_order() {
        let b = user(2);
        let mut a = MembershipRoster::new();
        a.set_accepted(&b).unwrap();
        let accepted = push_payload(&mut a);
        a.set_promoted(&b, false).unwrap();
        let promoted = push_payload(&mut a);
        a.erase(&b).unwrap();
        let removed = push_payload(&mut a);

        let orders = [
            [&accepted, &promoted, &removed],
            [&removed, &promoted, &accepted],
            [&promoted, &removed, &accepted],
            [&removed, &accepted, &promoted],
        ];
        for order in orders {
            let mut r = MembershipRoster::new();
            let mut seen_removed = false;
            for payload in order {
                r.merge_payload(payload).unwrap();
                let status = r.get(&b).unwrap().status;
                if seen_removed {
                    assert_eq!(status, MemberStatus::Removed);
                }
                seen_removed |= status == MemberStatus::Removed;
            }
            assert_eq!(r.get(&b).unwrap().status, MemberStatus::Removed);
        }
    }

    #[test]
    fn test_merge_commutative() {
        let b = user(2);
        let c = user(3);
        let mut x = MembershipRoster::new();
        let mut y = MembershipRoster::new();
        x.set_accepted(&b).unwrap();
        x.set_invited(&c, true).unwrap();
        y.set_invited(&b, false).unwrap();
        y.set_invited(&c, false).unwrap();
        y.set_accepted(&c).unwrap();
        let px = push_payload(&mut x);
        let py = push_payload(&mut y);

        let mut xy = MembershipRoster::new();
        xy.merge_payload(&px).unwrap();
        xy.merge_payload(&py).unwrap();
        let mut yx = MembershipRoster::new();
        yx.merge_payload(&py).unwrap();
        yx.merge_payload(&px).unwrap();

        assert_eq!(xy.store().state(), yx.store().state());
        assert_eq!(xy.get(&b).unwrap().status, MemberStatus::Accepted);
        assert_eq!(xy.get(&c).unwrap().status, MemberStatus::Accepted);
    }
}
