/// Guardrail constants, enforced at every API boundary.
///
/// These bound the size of everything a remote writer can make us store, and
/// fix the defaults of the key retention policy.

/// Version byte written at the front of every dump.
pub const DUMP_FORMAT_VERSION: u8 = 1;

/// Version byte of sealed config push messages.
pub const CONFIG_MESSAGE_VERSION: u8 = 1;

/// Version byte of key (rekey / supplement) messages.
pub const KEY_MESSAGE_VERSION: u8 = 1;

/// Version byte of encrypted group messages.
pub const GROUP_MESSAGE_VERSION: u8 = 1;

/// Max length of a group, member or legacy-group name, in bytes.
pub const MAX_NAME_LENGTH: usize = 100;

/// Max length of a group description, in bytes.
pub const MAX_DESCRIPTION_LENGTH: usize = 2_000;

/// Max length of a profile picture url, in bytes.
pub const MAX_URL_LENGTH: usize = 223;

/// Max length of a community base url (scheme + host + port), in bytes.
pub const MAX_BASE_URL_LENGTH: usize = 267;

/// Max length of a community room token, in bytes.
pub const MAX_ROOM_LENGTH: usize = 64;

/// Length of a profile picture decryption key.
pub const PROFILE_KEY_LENGTH: usize = 32;

/// Length of the auth credential a non-admin member uses for a group.
pub const GROUP_AUTH_DATA_LENGTH: usize = 100;

/// Max recipients a single key message is wrapped for.
pub const MAX_KEY_RECIPIENTS: usize = 2_000;

/// Superseded keys are dropped this long after the key that replaced them.
pub const DEFAULT_SUPERSEDED_KEY_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1000; // 30 days

/// Max payload accepted in a single push or key message.
pub const MAX_MESSAGE_BYTES: usize = 512 * 1024; // 512 KB

/// Check a text field against its byte limit.
pub fn check_length(value: &str, max: usize) -> Result<(), usize> {
    if value.len() > max {
        Err(value.len())
    } else {
        Ok(())
    }
}
