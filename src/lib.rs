//! # Conclave Core
//!
//! **Conflict-free group configuration for end-to-end encrypted messaging.**
//!
//! Every device of a user, and every admin of a group, edits group state on
//! its own: name, membership, encryption keys, and the per-user list of groups.
//! Conclave reconciles those edits into one view without a coordinator and
//! computes what has to be pushed to the other writers.
//!
//! - **Deterministic merges** (per-field lamport registers, lexicographic tie-break)
//! - **Monotone membership** (authority-ordered member states, tombstoned removals)
//! - **Group key rotation** (generation-numbered keys wrapped per member)
//! - **Replayable push/dump protocol** (per-store sequence numbers, versioned dumps)
//!
//! ## Quick Start
//!
//! ```rust
//! use conclave::crypto::generate_keypair;
//! use conclave::groups::{GroupConfig, GroupDumps, InfoUpdate};
//!
//! let (_user_pk, user_sk) = generate_keypair();
//! let (group_pk, group_sk) = generate_keypair();
//!
//! let mut group = GroupConfig::init(&user_sk, &group_pk, Some(&group_sk), GroupDumps::default())
//!     .expect("init");
//! group
//!     .info_set(InfoUpdate { name: Some("Book club".into()), ..Default::default() })
//!     .expect("set name");
//!
//! let batch = group.push().expect("push");
//! assert!(!batch.is_empty());
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`identity`] | Session ids, user and group key material |
//! | [`crypto`] | AEAD, HKDF, Ed25519 signatures, X25519 agreement |
//! | [`store`] | Lamport registers, config-store base, dump codec, sealed push messages |
//! | [`groups`] | Group metadata, membership roster, key ring, and the `GroupConfig` orchestrator |
//! | `user_groups` | Per-user registry of communities, legacy groups and groups |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `std` | Yes | Standard library support |
//! | `user-groups` | Yes | The per-user groups registry |
//! | `wasm` | No | WebAssembly support (`getrandom/js`) |

// Crate-level lint configuration: stylistic lints only.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

// ── Public modules ──────────────────────────────────────────────────────────

/// Guardrail constants and retention defaults.
pub mod limits;

/// Session ids and the user / group key material they are derived from.
pub mod identity;

/// Cryptographic primitives: AEAD, key derivation, signing, key agreement.
pub mod crypto;

/// Shared config-store machinery: registers, clocks, dumps, sealed messages.
pub mod store;

/// Per-group state: metadata, membership, keys, and their orchestrator.
pub mod groups;

/// Per-user registry of communities, legacy groups and groups.
#[cfg(feature = "user-groups")]
pub mod user_groups;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use groups::{
    DumpEntry, GroupConfig, GroupConfigError, GroupConfigOptions, GroupDumps, GroupInfo,
    InfoUpdate, KeyLoadOutcome, KeyRetention, Member, MemberStatus, PushEntry,
};
pub use identity::{GroupKeys, SessionId, UserKeys};
pub use store::StoreKind;

#[cfg(feature = "user-groups")]
pub use user_groups::{UserGroupEntry, UserGroupsError, UserGroupsRegistry};

// ── Library metadata ────────────────────────────────────────────────────────

/// Conclave core version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
