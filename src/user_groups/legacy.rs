/// Legacy groups: a `05`-style pseudo session id, a name, a shared
/// encryption key pair and a member list with admin flags.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::{IdentityError, SessionId};
use crate::limits::{check_length, MAX_NAME_LENGTH};
use crate::store::Lww;
use crate::user_groups::{
    write_visible, BaseGroup, BaseRecord, Result, SecretBytes, UserGroupsError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LegacyMember {
    pub session_id: SessionId,
    pub is_admin: bool,
}

/// A legacy group as read from or written to the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyGroupInfo {
    pub session_id: SessionId,
    pub name: String,
    /// 32 bytes, or empty when unknown.
    pub enc_pubkey: Vec<u8>,
    /// 32 bytes, or empty when unknown.
    pub enc_seckey: SecretBytes,
    /// Ordered by session id.
    pub members: Vec<LegacyMember>,
    pub disappearing_timer_seconds: u32,
    pub base: BaseGroup,
}

impl LegacyGroupInfo {
    pub fn new(session_id: SessionId) -> Self {
        LegacyGroupInfo {
            session_id,
            name: String::new(),
            enc_pubkey: Vec::new(),
            enc_seckey: SecretBytes::default(),
            members: Vec::new(),
            disappearing_timer_seconds: 0,
            base: BaseGroup::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.session_id.is_user() {
            return Err(UserGroupsError::Identity(IdentityError::WrongKind {
                expected: "user",
            }));
        }
        check_length(&self.name, MAX_NAME_LENGTH).map_err(UserGroupsError::NameTooLong)?;
        for len in [self.enc_pubkey.len(), self.enc_seckey.len()] {
            if len != 0 && len != 32 {
                return Err(UserGroupsError::InvalidEncryptionKey(len));
            }
        }
        if self.members.iter().any(|m| !m.session_id.is_user()) {
            return Err(UserGroupsError::Identity(IdentityError::WrongKind {
                expected: "user",
            }));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct LegacyRecord {
    pub(crate) base: BaseRecord,
    name: Lww<String>,
    enc_pubkey: Lww<Vec<u8>>,
    enc_seckey: Lww<SecretBytes>,
    /// Member id to admin flag. Replaced as a whole.
    members: Lww<BTreeMap<SessionId, bool>>,
    disappearing_timer_seconds: Lww<u32>,
}

impl LegacyRecord {
    /// Overwrite every field with `info`. Returns true when anything
    /// visible changed.
    pub(crate) fn write(&mut self, info: &LegacyGroupInfo, ts: u64) -> bool {
        let was_live = self.base.is_live();
        let horizon = self.base.erased_at();
        let members: BTreeMap<SessionId, bool> = info
            .members
            .iter()
            .map(|m| (m.session_id, m.is_admin))
            .collect();

        let mut changed = write_visible(&mut self.name, info.name.clone(), ts, horizon);
        changed |= write_visible(&mut self.enc_pubkey, info.enc_pubkey.clone(), ts, horizon);
        changed |= write_visible(&mut self.enc_seckey, info.enc_seckey.clone(), ts, horizon);
        changed |= write_visible(&mut self.members, members, ts, horizon);
        changed |= write_visible(
            &mut self.disappearing_timer_seconds,
            info.disappearing_timer_seconds,
            ts,
            horizon,
        );
        changed |= self.base.set_priority(info.base.priority, ts);
        changed |= self.base.set_joined_at(info.base.joined_at_seconds, ts);

        if changed || !was_live {
            self.base.touch(ts);
        }
        changed || !was_live
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.base.merge(&other.base);
        self.name.merge(&other.name);
        self.enc_pubkey.merge(&other.enc_pubkey);
        self.enc_seckey.merge(&other.enc_seckey);
        self.members.merge(&other.members);
        self.disappearing_timer_seconds
            .merge(&other.disappearing_timer_seconds);
    }

    pub(crate) fn view(&self, session_id: SessionId) -> LegacyGroupInfo {
        let horizon = self.base.erased_at();
        LegacyGroupInfo {
            session_id,
            name: self.name.visible_after(horizon),
            enc_pubkey: self.enc_pubkey.visible_after(horizon),
            enc_seckey: self.enc_seckey.visible_after(horizon),
            members: self
                .members
                .visible_after(horizon)
                .into_iter()
                .map(|(session_id, is_admin)| LegacyMember {
                    session_id,
                    is_admin,
                })
                .collect(),
            disappearing_timer_seconds: self.disappearing_timer_seconds.visible_after(horizon),
            base: self.base.view(),
        }
    }
}
