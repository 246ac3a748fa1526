/// `03` groups as tracked in the user's registry.
///
/// Status is a tiered register: `Destroyed` outranks everything; among the
/// rest the newest write wins, ties broken Kicked > InvitePending > Joined.
/// An older merge can therefore never clear a kick, while a newer invite
/// can.
use serde::{Deserialize, Serialize};

use crate::identity::SessionId;
use crate::limits::{check_length, GROUP_AUTH_DATA_LENGTH, MAX_NAME_LENGTH};
use crate::store::{Authority, Lww, Tiered};
use crate::user_groups::{
    write_visible, BaseGroup, BaseRecord, Result, SecretBytes, UserGroupsError,
};

// ---------------------------------------------------------------------------
// GroupStatus
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum GroupStatus {
    #[default]
    Joined = 0,
    InvitePending = 1,
    Kicked = 2,
    Destroyed = 3,
}

impl Authority for GroupStatus {
    fn tier(&self) -> u8 {
        match self {
            GroupStatus::Destroyed => 1,
            _ => 0,
        }
    }

    fn code(&self) -> u8 {
        *self as u8
    }
}

// ---------------------------------------------------------------------------
// Views and updates
// ---------------------------------------------------------------------------

/// Merged view of one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserGroupInfo {
    pub session_id: SessionId,
    /// 64-byte admin secret key, when held.
    pub secret_key: Option<SecretBytes>,
    /// 100-byte auth credential, when held.
    pub auth_data: Option<SecretBytes>,
    pub name: Option<String>,
    pub status: GroupStatus,
    pub disappearing_timer_seconds: u32,
    pub base: BaseGroup,
}

impl UserGroupInfo {
    pub fn invite_pending(&self) -> bool {
        self.status == GroupStatus::InvitePending
    }

    /// False once the group is destroyed, even if we were kicked before.
    pub fn kicked(&self) -> bool {
        self.status == GroupStatus::Kicked
    }

    pub fn destroyed(&self) -> bool {
        self.status == GroupStatus::Destroyed
    }
}

/// Partial update for [`UserGroupsRegistry::set_group`](crate::user_groups::UserGroupsRegistry::set_group).
/// `None` leaves a field alone; an empty secret key or auth data clears it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupUpdate {
    pub secret_key: Option<Vec<u8>>,
    pub auth_data: Option<Vec<u8>>,
    pub name: Option<String>,
    pub invite_pending: Option<bool>,
    pub priority: Option<i64>,
    pub joined_at_seconds: Option<i64>,
    pub disappearing_timer_seconds: Option<u32>,
}

impl GroupUpdate {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            check_length(name, MAX_NAME_LENGTH).map_err(UserGroupsError::NameTooLong)?;
        }
        if let Some(auth) = &self.auth_data {
            if !auth.is_empty() && auth.len() != GROUP_AUTH_DATA_LENGTH {
                return Err(UserGroupsError::InvalidAuthData(auth.len()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct GroupRecord {
    pub(crate) base: BaseRecord,
    secret_key: Lww<SecretBytes>,
    auth_data: Lww<SecretBytes>,
    name: Lww<String>,
    disappearing_timer_seconds: Lww<u32>,
    status: Tiered<GroupStatus>,
}

impl GroupRecord {
    pub(crate) fn status(&self) -> GroupStatus {
        let status = *self.status.get();
        // an erase resets everything but destruction
        if status == GroupStatus::Destroyed || self.status.ts() > self.base.erased_at() {
            status
        } else {
            GroupStatus::Joined
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.status(), GroupStatus::Kicked | GroupStatus::Destroyed)
    }

    /// Apply `update`; the secret key must already be validated against the
    /// group id. Returns true when anything visible changed.
    pub(crate) fn apply(&mut self, update: &GroupUpdate, ts: u64) -> bool {
        let was_live = self.base.is_live();
        let horizon = self.base.erased_at();
        let mut changed = false;

        if let Some(key) = &update.secret_key {
            changed |= write_visible(&mut self.secret_key, SecretBytes::new(key.clone()), ts, horizon);
        }
        if let Some(auth) = &update.auth_data {
            changed |= write_visible(&mut self.auth_data, SecretBytes::new(auth.clone()), ts, horizon);
        }
        if let Some(name) = &update.name {
            changed |= write_visible(&mut self.name, name.clone(), ts, horizon);
        }
        if let Some(timer) = update.disappearing_timer_seconds {
            changed |= write_visible(&mut self.disappearing_timer_seconds, timer, ts, horizon);
        }
        if let Some(priority) = update.priority {
            changed |= self.base.set_priority(priority, ts);
        }
        if let Some(joined) = update.joined_at_seconds {
            changed |= self.base.set_joined_at(joined, ts);
        }
        if let Some(pending) = update.invite_pending {
            let target = if pending {
                GroupStatus::InvitePending
            } else {
                GroupStatus::Joined
            };
            changed |= self.set_status(target, ts);
        }

        if changed || !was_live {
            self.base.touch(ts);
        }
        changed || !was_live
    }

    /// Move to `status`. Destroyed is final.
    pub(crate) fn set_status(&mut self, status: GroupStatus, ts: u64) -> bool {
        if self.status() == status || self.status() == GroupStatus::Destroyed {
            return false;
        }
        self.status.set(status, ts)
    }

    /// Forget the admin key and auth credential.
    pub(crate) fn drop_credentials(&mut self, ts: u64) -> bool {
        let horizon = self.base.erased_at();
        let a = write_visible(&mut self.secret_key, SecretBytes::default(), ts, horizon);
        let b = write_visible(&mut self.auth_data, SecretBytes::default(), ts, horizon);
        a || b
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.base.merge(&other.base);
        self.secret_key.merge(&other.secret_key);
        self.auth_data.merge(&other.auth_data);
        self.name.merge(&other.name);
        self.disappearing_timer_seconds
            .merge(&other.disappearing_timer_seconds);
        self.status.merge(&other.status);
    }

    pub(crate) fn view(&self, session_id: SessionId) -> UserGroupInfo {
        let horizon = self.base.erased_at();
        let non_empty = |bytes: SecretBytes| if bytes.is_empty() { None } else { Some(bytes) };
        let name = self.name.visible_after(horizon);
        UserGroupInfo {
            session_id,
            secret_key: non_empty(self.secret_key.visible_after(horizon)),
            auth_data: non_empty(self.auth_data.visible_after(horizon)),
            name: if name.is_empty() { None } else { Some(name) },
            status: self.status(),
            disappearing_timer_seconds: self.disappearing_timer_seconds.visible_after(horizon),
            base: self.base.view(),
        }
    }
}
