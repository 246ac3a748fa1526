/// Per-group configuration: three merged stores behind one orchestrator.
///
/// Every admin device edits the group on its own; pushes from other admins
/// are merged field by field and converge regardless of arrival order.
///
/// # Module structure
/// - `info` - LWW group metadata (name, description, picture, retention, destroy)
/// - `members` - membership roster with an authority-ordered status ladder
/// - `keys` - generation-numbered group keys, rotation, message encryption
/// - `config` - `GroupConfig`, the push / dump / merge surface over all three
pub mod config;
pub mod info;
pub mod keys;
pub mod members;

// Re-export core types for convenience
pub use crate::store::{DumpEntry, PushEntry};
pub use config::{GroupConfig, GroupConfigError, GroupConfigOptions, GroupDumps};
pub use info::{GroupInfo, GroupMetadata, InfoUpdate, MetadataError, ProfilePic};
pub use keys::{
    parse_message, DecryptedMessage, KeyInfo, KeyLoadOutcome, KeyMessage, KeyMessageKind,
    KeyRetention, KeyRing, KeyRingError,
};
pub use members::{Member, MemberStatus, MembershipError, MembershipRoster, RosterMerge};
