/// Group key ring: generation-numbered symmetric keys, rotation, and
/// message encryption.
///
/// A rekey creates generation `current + 1` with a fresh random key. The key
/// bundle is sealed once under a one-off content key, and that content key is
/// wrapped once per key-holding member (X25519 against a one-off ephemeral
/// key, HKDF, XChaCha20-Poly1305) plus once for the admins (key derived from
/// the group secret). The whole message is signed by the group key.
///
/// Member boxes carry no recipient ids; a member finds its box by trying
/// each one. The recipient list travels inside the sealed bundle, so only
/// key holders learn it.
///
/// Removal safety: every key remembers who it was handed to, and the ring
/// remembers every removal it has observed. While a removed member holds the
/// current key, `encrypt_message` refuses and admin instances report
/// `needs_rekey`, no matter in which order removals and keys arrive.
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::{
    self, derive_key, derive_shared_secret, generate_ephemeral_keypair, EncryptionError,
    SymmetricKey,
};
use crate::identity::{GroupKeys, SessionId, UserKeys};
use crate::limits::{
    DEFAULT_SUPERSEDED_KEY_TTL_MS, GROUP_MESSAGE_VERSION, KEY_MESSAGE_VERSION,
    MAX_KEY_RECIPIENTS, MAX_MESSAGE_BYTES,
};
use crate::store::{cbor_decode, cbor_encode, decode_dump, encode_dump, now_ms};
use crate::store::{StoreError, StoreKind};

const ADMIN_KEY_INFO: &[u8] = b"conclave-admin-key";
const BUNDLE_AD: &[u8] = b"conclave-key-bundle";
const MEMBER_KEY_INFO: &[u8] = b"conclave-member-key";
const MESSAGE_SIG_CONTEXT: &[u8] = b"conclave-msg";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyRingError {
    #[error("Operation requires the group secret key")]
    NotAdmin,

    #[error("Key ring holds no keys")]
    NoKeys,

    #[error("A member was removed; rekey before sending")]
    RekeyRequired,

    #[error("Malformed key message: {0}")]
    MalformedMessage(String),

    #[error("Unsupported message version {0}")]
    UnsupportedVersion(u8),

    #[error("Message belongs to another group")]
    WrongGroup,

    #[error("Signature verification failed")]
    AuthenticationFailed,

    #[error("No retained key decrypts the message")]
    DecryptionFailed,

    #[error("Too many recipients ({count} > {max})")]
    TooManyRecipients { count: usize, max: usize },

    #[error("Recipient is not a user session id")]
    InvalidRecipient,

    #[error("Message exceeds max size ({size} > {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Crypto error: {0}")]
    Crypto(#[from] EncryptionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, KeyRingError>;

// ---------------------------------------------------------------------------
// Retention policy
// ---------------------------------------------------------------------------

/// How long superseded keys are kept, and when the current one goes stale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRetention {
    /// A key is pruned once it has been superseded for longer than this,
    /// measured against the current key's timestamp.
    pub superseded_ttl_ms: u64,
    /// When set, admins report `needs_rekey` once the current key is older.
    pub rotate_after_ms: Option<u64>,
}

impl Default for KeyRetention {
    fn default() -> Self {
        KeyRetention {
            superseded_ttl_ms: DEFAULT_SUPERSEDED_KEY_TTL_MS,
            rotate_after_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyMessageKind {
    Rekey,
    Supplement,
}

/// Rekey / supplement message. Outer encoding is bincode.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KeyMessage {
    pub version: u8,
    pub group: [u8; 32],
    pub kind: KeyMessageKind,
    pub timestamp_ms: u64,
    pub ephemeral: [u8; 32],
    /// Key bundle sealed under the content key.
    pub bundle: Vec<u8>,
    /// Content key wrapped for the admins.
    pub admin_box: Vec<u8>,
    /// Content key wrapped once per member.
    pub member_boxes: Vec<Vec<u8>>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

#[derive(Serialize)]
struct KeyMessageSignable<'a> {
    version: u8,
    group: &'a [u8; 32],
    kind: KeyMessageKind,
    timestamp_ms: u64,
    ephemeral: &'a [u8; 32],
    bundle: &'a [u8],
    admin_box: &'a [u8],
    member_boxes: &'a [Vec<u8>],
}

impl KeyMessage {
    fn signable_hash(&self) -> Result<[u8; 32]> {
        let signable = KeyMessageSignable {
            version: self.version,
            group: &self.group,
            kind: self.kind,
            timestamp_ms: self.timestamp_ms,
            ephemeral: &self.ephemeral,
            bundle: &self.bundle,
            admin_box: &self.admin_box,
            member_boxes: &self.member_boxes,
        };
        let bytes = bincode::serialize(&signable)
            .map_err(|e| KeyRingError::MalformedMessage(e.to_string()))?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

/// Plaintext of the sealed bundle (CBOR).
#[derive(Serialize, Deserialize)]
struct KeyBundle {
    keys: Vec<BundledKey>,
    /// Members the keys were wrapped for in this message.
    recipients: Vec<SessionId>,
}

#[derive(Serialize, Deserialize)]
struct BundledKey {
    generation: u64,
    timestamp_ms: u64,
    key: SymmetricKey,
}

/// Plaintext of an encrypted group message (CBOR).
#[derive(Serialize, Deserialize)]
struct SignedBody {
    sender: [u8; 32],
    #[serde(with = "BigArray")]
    signature: [u8; 64],
    body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Outcomes and views
// ---------------------------------------------------------------------------

/// Result of ingesting a key message. Only malformed or forged messages are
/// errors; everything here leaves the ring consistent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLoadOutcome {
    /// Keys were added (or the hash attached to keys already held).
    Loaded { generation: u64, advanced: bool },
    /// This hash was already processed.
    AlreadyKnown,
    /// No box in the message is addressed to us.
    NotRecipient,
    /// Every key in the message is past the retention horizon.
    Expired,
}

/// Metadata of a retained key. The key bytes never leave the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    pub generation: u64,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Sender's `05` session id.
    pub sender: SessionId,
    pub sender_ed25519: [u8; 32],
    pub plaintext: Vec<u8>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug)]
struct KeyEntry {
    generation: u64,
    timestamp_ms: u64,
    key: SymmetricKey,
    /// Every member this key is known to have been wrapped for.
    recipients: BTreeSet<SessionId>,
    /// Transport hashes of messages that carried this key.
    hashes: BTreeSet<String>,
    pushed: bool,
}

impl KeyEntry {
    fn order(a: &KeyEntry, b: &KeyEntry) -> Ordering {
        (a.generation, a.timestamp_ms)
            .cmp(&(b.generation, b.timestamp_ms))
            .then_with(|| a.key.as_bytes().cmp(b.key.as_bytes()))
    }

    fn bundled(&self) -> BundledKey {
        BundledKey {
            generation: self.generation,
            timestamp_ms: self.timestamp_ms,
            key: self.key.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct KeyRingState {
    group: [u8; 32],
    /// Sorted by (generation, timestamp, key); the last entry is current.
    entries: Vec<KeyEntry>,
    seqno: u64,
    pending: Option<Vec<u8>>,
    /// Members whose removal has been observed. Removal is final.
    removed: BTreeSet<SessionId>,
    last_timestamp_ms: u64,
}

impl KeyRingState {
    fn current(&self) -> Option<&KeyEntry> {
        self.entries.last()
    }

    fn sort(&mut self) {
        self.entries.sort_by(KeyEntry::order);
    }

    /// Drop pushed, non-current keys superseded longer than `ttl_ms` ago.
    fn prune(&mut self, ttl_ms: u64) {
        let n = self.entries.len();
        if n <= 1 {
            return;
        }
        let current_ts = self.entries[n - 1].timestamp_ms;
        let superseded_at: Vec<u64> = self.entries[1..].iter().map(|e| e.timestamp_ms).collect();
        let mut index = 0;
        self.entries.retain(|e| {
            let keep = index == n - 1
                || !e.pushed
                || superseded_at[index].saturating_add(ttl_ms) >= current_ts;
            index += 1;
            keep
        });
    }

    /// True while a removed member holds the current key.
    fn exposed(&self) -> bool {
        self.current()
            .map_or(false, |c| c.recipients.iter().any(|r| self.removed.contains(r)))
    }
}

// ---------------------------------------------------------------------------
// KeyRing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct KeyRing {
    state: KeyRingState,
    retention: KeyRetention,
    needs_dump: bool,
}

impl KeyRing {
    pub fn new(group_public: [u8; 32], retention: KeyRetention) -> Self {
        KeyRing {
            state: KeyRingState {
                group: group_public,
                ..Default::default()
            },
            retention,
            needs_dump: false,
        }
    }

    pub fn from_dump(group_public: [u8; 32], data: &[u8], retention: KeyRetention) -> Result<Self> {
        let state: KeyRingState = decode_dump(StoreKind::GroupKeys, data)?;
        if state.group != group_public {
            return Err(KeyRingError::WrongGroup);
        }
        Ok(KeyRing {
            state,
            retention,
            needs_dump: false,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    /// Current generation, if any key is held.
    pub fn generation(&self) -> Option<u64> {
        self.state.current().map(|e| e.generation)
    }

    /// Whether a removal is waiting for a rekey.
    pub fn removal_pending(&self) -> bool {
        self.state.exposed()
    }

    /// Retained keys, newest first.
    pub fn group_keys(&self) -> Vec<KeyInfo> {
        self.state
            .entries
            .iter()
            .rev()
            .map(|e| KeyInfo {
                generation: e.generation,
                timestamp_ms: e.timestamp_ms,
            })
            .collect()
    }

    /// Hashes of the key messages whose keys are still retained.
    pub fn current_hashes(&self) -> Vec<String> {
        let all: BTreeSet<&String> = self.state.entries.iter().flat_map(|e| &e.hashes).collect();
        all.into_iter().cloned().collect()
    }

    /// Admin-only: does the ring need a new generation?
    pub fn needs_rekey(&self, group: &GroupKeys) -> bool {
        if !group.is_admin() {
            return false;
        }
        let current = match self.state.current() {
            Some(c) => c,
            None => return true,
        };
        if self.state.exposed() {
            return true;
        }
        let at_max = self
            .state
            .entries
            .iter()
            .filter(|e| e.generation == current.generation)
            .count();
        if at_max > 1 {
            return true;
        }
        match self.retention.rotate_after_ms {
            Some(age) => now_ms() > current.timestamp_ms.saturating_add(age),
            None => false,
        }
    }

    /// Record an observed member removal.
    ///
    /// Returns true when the removed member holds the current key, i.e. the
    /// ring is now waiting for a rekey.
    pub fn note_member_removed(&mut self, member: &SessionId) -> bool {
        if self.state.removed.insert(*member) {
            self.needs_dump = true;
        }
        let holds_current = self
            .state
            .current()
            .map_or(false, |c| c.recipients.contains(member));
        if holds_current {
            log::info!(
                "Removed member {:?} holds key generation {:?}",
                member,
                self.generation()
            );
        }
        holds_current
    }

    /// Create the next generation and queue its key message for push.
    ///
    /// `recipients` are the members that should hold the new key.
    pub fn rekey(&mut self, group: &GroupKeys, recipients: &[SessionId]) -> Result<Vec<u8>> {
        let seed = group.seed().ok_or(KeyRingError::NotAdmin)?;
        let generation = self.generation().map_or(0, |g| g + 1);
        let timestamp_ms = now_ms().max(self.state.last_timestamp_ms.saturating_add(1));

        let entry = KeyEntry {
            generation,
            timestamp_ms,
            key: SymmetricKey::generate(),
            recipients: recipients.iter().copied().collect(),
            hashes: BTreeSet::new(),
            pushed: false,
        };

        // unpushed keys ride along so a replaced pending message loses nothing
        let mut keys = vec![entry.bundled()];
        keys.extend(
            self.state
                .entries
                .iter()
                .filter(|e| !e.pushed)
                .map(KeyEntry::bundled),
        );

        let data = build_message(
            group.public(),
            seed,
            KeyMessageKind::Rekey,
            timestamp_ms,
            &KeyBundle {
                keys,
                recipients: recipients.to_vec(),
            },
        )?;

        self.state.entries.push(entry);
        self.state.sort();
        self.state.last_timestamp_ms = timestamp_ms;
        self.state.pending = Some(data.clone());
        self.state.prune(self.retention.superseded_ttl_ms);
        self.needs_dump = true;

        log::info!(
            "Rekeyed {:?} to generation {} for {} members",
            group.session_id(),
            generation,
            recipients.len()
        );
        Ok(data)
    }

    /// Wrap every retained key for `recipients` without rotating.
    ///
    /// The message is returned for the caller to send; it is not queued.
    /// The recipients are recorded as holders of every retained key.
    pub fn supplement(&mut self, group: &GroupKeys, recipients: &[SessionId]) -> Result<Vec<u8>> {
        let seed = group.seed().ok_or(KeyRingError::NotAdmin)?;
        if self.state.entries.is_empty() {
            return Err(KeyRingError::NoKeys);
        }
        let keys = self.state.entries.iter().map(KeyEntry::bundled).collect();
        let timestamp_ms = now_ms().max(self.state.last_timestamp_ms);
        let data = build_message(
            group.public(),
            seed,
            KeyMessageKind::Supplement,
            timestamp_ms,
            &KeyBundle {
                keys,
                recipients: recipients.to_vec(),
            },
        )?;
        for entry in &mut self.state.entries {
            entry.recipients.extend(recipients.iter().copied());
        }
        self.needs_dump = true;
        log::debug!(
            "Supplement of {} keys for {} members",
            self.state.entries.len(),
            recipients.len()
        );
        Ok(data)
    }

    /// Ingest a key message received from the transport.
    pub fn load_key_message(
        &mut self,
        user: &UserKeys,
        group: &GroupKeys,
        data: &[u8],
        hash: &str,
        timestamp_ms: u64,
    ) -> Result<KeyLoadOutcome> {
        if self.state.entries.iter().any(|e| e.hashes.contains(hash)) {
            log::debug!("Key message {} already processed", hash);
            return Ok(KeyLoadOutcome::AlreadyKnown);
        }

        let msg = parse_message(data)?;
        if msg.group != self.state.group {
            return Err(KeyRingError::WrongGroup);
        }
        let digest = msg.signable_hash()?;
        let valid = crypto::verify_signature(&digest, &msg.signature, &msg.group)
            .map_err(|_| KeyRingError::AuthenticationFailed)?;
        if !valid {
            return Err(KeyRingError::AuthenticationFailed);
        }

        let bundle = match open_bundle(&msg, user, group)? {
            Some(bundle) => bundle,
            None => return Ok(KeyLoadOutcome::NotRecipient),
        };

        let before = self.generation();
        let mut next = self.state.clone();
        for k in bundle.keys {
            let existing = next
                .entries
                .iter_mut()
                .find(|e| e.generation == k.generation && e.key == k.key);
            match existing {
                Some(entry) => {
                    entry.hashes.insert(hash.to_string());
                    entry.recipients.extend(bundle.recipients.iter().copied());
                    entry.pushed = true;
                }
                None => {
                    let mut hashes = BTreeSet::new();
                    hashes.insert(hash.to_string());
                    next.entries.push(KeyEntry {
                        generation: k.generation,
                        timestamp_ms: k.timestamp_ms,
                        key: k.key.clone(),
                        recipients: bundle.recipients.iter().copied().collect(),
                        hashes,
                        pushed: true,
                    });
                }
            }
        }
        next.sort();
        next.prune(self.retention.superseded_ttl_ms);

        if !next.entries.iter().any(|e| e.hashes.contains(hash)) {
            log::debug!("Key message {} only carried expired keys", hash);
            return Ok(KeyLoadOutcome::Expired);
        }

        next.last_timestamp_ms = next
            .last_timestamp_ms
            .max(msg.timestamp_ms)
            .max(timestamp_ms);
        self.state = next;
        self.needs_dump = true;

        let generation = self.generation().unwrap_or(0);
        let advanced = before.map_or(true, |b| generation > b);
        if advanced {
            log::info!("Key ring advanced to generation {}", generation);
        }
        if self.state.exposed() {
            log::warn!("Current key generation {} is held by a removed member", generation);
        }
        Ok(KeyLoadOutcome::Loaded {
            generation,
            advanced,
        })
    }

    /// Encrypt a group message under the current key, signed by the sender.
    pub fn encrypt_message(&self, sender: &UserKeys, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.state.exposed() {
            return Err(KeyRingError::RekeyRequired);
        }
        let current = self.state.current().ok_or(KeyRingError::NoKeys)?;

        let signature = crypto::sign_data(
            &message_signable(&self.state.group, plaintext),
            sender.ed25519_seed(),
        );
        let inner = cbor_encode(&SignedBody {
            sender: *sender.ed25519_public(),
            signature,
            body: plaintext.to_vec(),
        })?;

        let ad = message_ad(&self.state.group);
        let ciphertext = crypto::encrypt(&inner, &current.key, &ad)?;
        let mut out = Vec::with_capacity(1 + ciphertext.len());
        out.push(GROUP_MESSAGE_VERSION);
        out.extend_from_slice(&ciphertext);
        if out.len() > MAX_MESSAGE_BYTES {
            return Err(KeyRingError::MessageTooLarge {
                size: out.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }
        Ok(out)
    }

    /// Decrypt a group message, newest key first, and verify its sender.
    pub fn decrypt_message(&self, data: &[u8]) -> Result<DecryptedMessage> {
        let (&version, ciphertext) = data
            .split_first()
            .ok_or_else(|| KeyRingError::MalformedMessage("empty".into()))?;
        if version != GROUP_MESSAGE_VERSION {
            return Err(KeyRingError::UnsupportedVersion(version));
        }

        let ad = message_ad(&self.state.group);
        let inner = self
            .try_decrypt(ciphertext, &ad)
            .ok_or(KeyRingError::DecryptionFailed)?;
        let body: SignedBody =
            cbor_decode(&inner).map_err(|e| KeyRingError::MalformedMessage(e.to_string()))?;

        let valid = crypto::verify_signature(
            &message_signable(&self.state.group, &body.body),
            &body.signature,
            &body.sender,
        )
        .map_err(|_| KeyRingError::AuthenticationFailed)?;
        if !valid {
            return Err(KeyRingError::AuthenticationFailed);
        }

        let sender = ed25519_dalek::VerifyingKey::from_bytes(&body.sender)
            .map_err(|_| KeyRingError::AuthenticationFailed)?;
        Ok(DecryptedMessage {
            sender: SessionId::user(&sender.to_montgomery().to_bytes()),
            sender_ed25519: body.sender,
            plaintext: body.body,
        })
    }

    /// Try every retained key, newest first.
    pub(crate) fn try_decrypt(&self, ciphertext: &[u8], ad: &[u8]) -> Option<Vec<u8>> {
        self.state
            .entries
            .iter()
            .rev()
            .find_map(|e| crypto::decrypt(ciphertext, &e.key, ad).ok())
    }

    pub(crate) fn current_key(&self) -> Option<&SymmetricKey> {
        self.state.current().map(|e| &e.key)
    }

    pub fn needs_push(&self) -> bool {
        self.state.pending.is_some()
    }

    /// The queued key message, if any, with the seqno it will carry.
    pub fn pending_push(&self) -> Option<(u64, Vec<u8>)> {
        self.state
            .pending
            .as_ref()
            .map(|data| (self.state.seqno + 1, data.clone()))
    }

    pub fn confirm_push(&mut self, seqno: u64) {
        self.state.seqno = self.state.seqno.max(seqno);
        self.state.pending = None;
        for entry in &mut self.state.entries {
            entry.pushed = true;
        }
        self.needs_dump = true;
    }

    pub fn needs_dump(&self) -> bool {
        self.needs_dump
    }

    pub fn dump(&mut self) -> Result<Vec<u8>> {
        let data = self.snapshot()?;
        self.needs_dump = false;
        Ok(data)
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(encode_dump(StoreKind::GroupKeys, &self.state)?)
    }
}

// ---------------------------------------------------------------------------
// Message construction
// ---------------------------------------------------------------------------

fn build_message(
    group_public: &[u8; 32],
    group_seed: &[u8; 32],
    kind: KeyMessageKind,
    timestamp_ms: u64,
    bundle: &KeyBundle,
) -> Result<Vec<u8>> {
    let recipients = &bundle.recipients;
    if recipients.len() > MAX_KEY_RECIPIENTS {
        return Err(KeyRingError::TooManyRecipients {
            count: recipients.len(),
            max: MAX_KEY_RECIPIENTS,
        });
    }
    if recipients.iter().any(|r| !r.is_user()) {
        return Err(KeyRingError::InvalidRecipient);
    }

    let content_key = SymmetricKey::generate();
    let mut plaintext = cbor_encode(bundle)?;
    let sealed = crypto::encrypt(&plaintext, &content_key, &bundle_ad(group_public));
    plaintext.zeroize();
    let sealed = sealed?;

    let (ephemeral, mut ephemeral_secret) = generate_ephemeral_keypair();
    let admin_key = derive_key(
        group_seed,
        Some(&ephemeral[..]),
        &[ADMIN_KEY_INFO, &group_public[..]],
    )?;
    let admin_box = crypto::encrypt(content_key.as_bytes(), &admin_key, group_public)?;

    let mut member_boxes = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let their_public = recipient.pubkey();
        let mut shared = match derive_shared_secret(&ephemeral_secret, &their_public) {
            Some(shared) => shared,
            None => {
                ephemeral_secret.zeroize();
                return Err(KeyRingError::InvalidRecipient);
            }
        };
        let wrap_key = derive_key(
            &shared,
            Some(&ephemeral[..]),
            &[MEMBER_KEY_INFO, &their_public[..], &group_public[..]],
        );
        shared.zeroize();
        member_boxes.push(crypto::encrypt(content_key.as_bytes(), &wrap_key?, group_public)?);
    }
    ephemeral_secret.zeroize();
    member_boxes.sort();

    let mut msg = KeyMessage {
        version: KEY_MESSAGE_VERSION,
        group: *group_public,
        kind,
        timestamp_ms,
        ephemeral,
        bundle: sealed,
        admin_box,
        member_boxes,
        signature: [0u8; 64],
    };
    msg.signature = crypto::sign_data(&msg.signable_hash()?, group_seed);

    let bytes =
        bincode::serialize(&msg).map_err(|e| KeyRingError::MalformedMessage(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(KeyRingError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(bytes)
}

/// Decode and sanity-check a key message without verifying it.
pub fn parse_message(data: &[u8]) -> Result<KeyMessage> {
    if data.len() > MAX_MESSAGE_BYTES {
        return Err(KeyRingError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    let msg: KeyMessage =
        bincode::deserialize(data).map_err(|e| KeyRingError::MalformedMessage(e.to_string()))?;
    if msg.version != KEY_MESSAGE_VERSION {
        return Err(KeyRingError::UnsupportedVersion(msg.version));
    }
    if msg.member_boxes.len() > MAX_KEY_RECIPIENTS {
        return Err(KeyRingError::TooManyRecipients {
            count: msg.member_boxes.len(),
            max: MAX_KEY_RECIPIENTS,
        });
    }
    Ok(msg)
}

/// Find the box meant for us and open the bundle with it. `None` if there
/// is no such box.
fn open_bundle(msg: &KeyMessage, user: &UserKeys, group: &GroupKeys) -> Result<Option<KeyBundle>> {
    let content_key = match unwrap_content_key(msg, user, group)? {
        Some(key) => key,
        None => return Ok(None),
    };
    let mut plaintext = crypto::decrypt(&msg.bundle, &content_key, &bundle_ad(&msg.group))
        .map_err(|_| KeyRingError::MalformedMessage("sealed bundle does not open".into()))?;
    let bundle = cbor_decode::<KeyBundle>(&plaintext)
        .map_err(|e| KeyRingError::MalformedMessage(e.to_string()));
    plaintext.zeroize();
    let bundle = bundle?;
    if bundle.recipients.len() > MAX_KEY_RECIPIENTS {
        return Err(KeyRingError::TooManyRecipients {
            count: bundle.recipients.len(),
            max: MAX_KEY_RECIPIENTS,
        });
    }
    Ok(Some(bundle))
}

fn unwrap_content_key(
    msg: &KeyMessage,
    user: &UserKeys,
    group: &GroupKeys,
) -> Result<Option<SymmetricKey>> {
    if let Some(seed) = group.seed() {
        let admin_key = derive_key(
            seed,
            Some(&msg.ephemeral[..]),
            &[ADMIN_KEY_INFO, &msg.group[..]],
        )?;
        if let Ok(plaintext) = crypto::decrypt(&msg.admin_box, &admin_key, &msg.group) {
            return content_key_from(plaintext).map(Some);
        }
    }

    let mut shared = derive_shared_secret(user.x25519_secret(), &msg.ephemeral)
        .ok_or_else(|| KeyRingError::MalformedMessage("low-order ephemeral key".into()))?;
    let wrap_key = derive_key(
        &shared,
        Some(&msg.ephemeral[..]),
        &[MEMBER_KEY_INFO, &user.x25519_public()[..], &msg.group[..]],
    );
    shared.zeroize();
    let wrap_key = wrap_key?;

    for member_box in &msg.member_boxes {
        if let Ok(plaintext) = crypto::decrypt(member_box, &wrap_key, &msg.group) {
            return content_key_from(plaintext).map(Some);
        }
    }
    Ok(None)
}

fn content_key_from(mut plaintext: Vec<u8>) -> Result<SymmetricKey> {
    let key = <[u8; 32]>::try_from(plaintext.as_slice())
        .map(SymmetricKey::from_bytes)
        .map_err(|_| KeyRingError::MalformedMessage("bad content key length".into()));
    plaintext.zeroize();
    key
}

fn bundle_ad(group: &[u8; 32]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(BUNDLE_AD.len() + 32);
    ad.extend_from_slice(BUNDLE_AD);
    ad.extend_from_slice(group);
    ad
}

fn message_ad(group: &[u8; 32]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(33);
    ad.push(GROUP_MESSAGE_VERSION);
    ad.extend_from_slice(group);
    ad
}

fn message_signable(group: &[u8; 32], body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(MESSAGE_SIG_CONTEXT.len() + 32 + body.len());
    data.extend_from_slice(MESSAGE_SIG_CONTEXT);
    data.extend_from_slice(group);
    data.extend_from_slice(body);
    data
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    struct Fixture {
        admin_user: UserKeys,
        admin_group: GroupKeys,
        member_group: GroupKeys,
        group_public: [u8; 32],
    }

    fn fixture() -> Fixture {
        let (_, user_sk) = generate_keypair();
        let (group_pk, group_sk) = generate_keypair();
        Fixture {
            admin_user: UserKeys::from_secret_key(&user_sk).unwrap(),
            admin_group: GroupKeys::new(&group_pk, Some(&group_sk)).unwrap(),
            member_group: GroupKeys::new(&group_pk, None).unwrap(),
            group_public: group_pk,
        }
    }

    fn new_user() -> UserKeys {
        let (_, sk) = generate_keypair();
        UserKeys::from_secret_key(&sk).unwrap()
    }

    fn ring(f: &Fixture) -> KeyRing {
        KeyRing::new(f.group_public, KeyRetention::default())
    }

    fn entry(generation: u64, timestamp_ms: u64, pushed: bool) -> KeyEntry {
        KeyEntry {
            generation,
            timestamp_ms,
            key: SymmetricKey::generate(),
            recipients: BTreeSet::new(),
            hashes: BTreeSet::new(),
            pushed,
        }
    }

    #[test]
    fn test_first_rekey_is_generation_zero() {
        let f = fixture();
        let mut admin = ring(&f);
        assert!(admin.needs_rekey(&f.admin_group));
        admin.rekey(&f.admin_group, &[]).unwrap();
        assert_eq!(admin.generation(), Some(0));
        assert!(!admin.needs_rekey(&f.admin_group));
        assert!(admin.needs_push());
    }

    #[test]
    fn test_member_cannot_rekey() {
        let f = fixture();
        let mut member = ring(&f);
        assert!(!member.needs_rekey(&f.member_group));
        assert_eq!(
            member.rekey(&f.member_group, &[]),
            Err(KeyRingError::NotAdmin)
        );
    }

    #[test]
    fn test_member_loads_rekey() {
        let f = fixture();
        let bob = new_user();
        let mut admin = ring(&f);
        let msg = admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();

        let mut member = ring(&f);
        let outcome = member
            .load_key_message(&bob, &f.member_group, &msg, "h1", 1000)
            .unwrap();
        assert_eq!(
            outcome,
            KeyLoadOutcome::Loaded {
                generation: 0,
                advanced: true
            }
        );
        assert_eq!(member.current_hashes(), vec!["h1".to_string()]);

        // replay is a no-op
        assert_eq!(
            member
                .load_key_message(&bob, &f.member_group, &msg, "h1", 1000)
                .unwrap(),
            KeyLoadOutcome::AlreadyKnown
        );
    }

    #[test]
    fn test_non_recipient_learns_nothing() {
        let f = fixture();
        let bob = new_user();
        let carol = new_user();
        let mut admin = ring(&f);
        let msg = admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();

        let mut outsider = ring(&f);
        assert_eq!(
            outsider
                .load_key_message(&carol, &f.member_group, &msg, "h1", 0)
                .unwrap(),
            KeyLoadOutcome::NotRecipient
        );
        assert!(outsider.is_empty());
    }

    #[test]
    fn test_admin_box_opens_on_other_admin_device() {
        let f = fixture();
        let mut a = ring(&f);
        let msg = a.rekey(&f.admin_group, &[]).unwrap();

        let mut b = ring(&f);
        let other_device = new_user();
        let outcome = b
            .load_key_message(&other_device, &f.admin_group, &msg, "h", 0)
            .unwrap();
        assert!(matches!(outcome, KeyLoadOutcome::Loaded { .. }));
    }

    #[test]
    fn test_forged_message_rejected() {
        let f = fixture();
        let bob = new_user();
        let mut admin = ring(&f);
        let msg = admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();

        let mut parsed = parse_message(&msg).unwrap();
        parsed.timestamp_ms += 1;
        let forged = bincode::serialize(&parsed).unwrap();

        let mut member = ring(&f);
        assert_eq!(
            member.load_key_message(&bob, &f.member_group, &forged, "h", 0),
            Err(KeyRingError::AuthenticationFailed)
        );
        assert!(member.is_empty());
    }

    #[test]
    fn test_other_group_rejected() {
        let f = fixture();
        let other = fixture();
        let bob = new_user();
        let mut admin = ring(&other);
        let msg = admin
            .rekey(&other.admin_group, &[bob.session_id()])
            .unwrap();

        let mut member = ring(&f);
        assert_eq!(
            member.load_key_message(&bob, &f.member_group, &msg, "h", 0),
            Err(KeyRingError::WrongGroup)
        );
    }

    #[test]
    fn test_garbage_rejected() {
        let f = fixture();
        let mut member = ring(&f);
        let bob = new_user();
        assert!(matches!(
            member.load_key_message(&bob, &f.member_group, &[0xde, 0xad], "h", 0),
            Err(KeyRingError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_recipients_must_be_users() {
        let f = fixture();
        let mut admin = ring(&f);
        let group_id = SessionId::group(&[1; 32]);
        assert_eq!(
            admin.rekey(&f.admin_group, &[group_id]),
            Err(KeyRingError::InvalidRecipient)
        );
        assert!(admin.is_empty());
    }

    #[test]
    fn test_encrypt_decrypt_message() {
        let f = fixture();
        let bob = new_user();
        let mut admin = ring(&f);
        let msg = admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        let mut member = ring(&f);
        member
            .load_key_message(&bob, &f.member_group, &msg, "h", 0)
            .unwrap();

        let ciphertext = admin.encrypt_message(&f.admin_user, b"hello group").unwrap();
        let decrypted = member.decrypt_message(&ciphertext).unwrap();
        assert_eq!(decrypted.plaintext, b"hello group");
        assert_eq!(decrypted.sender, f.admin_user.session_id());
        assert_eq!(&decrypted.sender_ed25519, f.admin_user.ed25519_public());
    }

    #[test]
    fn test_decrypt_falls_back_to_older_generation() {
        let f = fixture();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[]).unwrap();
        let old = admin.encrypt_message(&f.admin_user, b"before").unwrap();
        admin.rekey(&f.admin_group, &[]).unwrap();
        assert_eq!(admin.generation(), Some(1));
        assert_eq!(admin.decrypt_message(&old).unwrap().plaintext, b"before");
    }

    #[test]
    fn test_tampered_message_fails() {
        let f = fixture();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[]).unwrap();
        let mut ciphertext = admin.encrypt_message(&f.admin_user, b"x").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        assert_eq!(
            admin.decrypt_message(&ciphertext),
            Err(KeyRingError::DecryptionFailed)
        );
        assert!(matches!(
            admin.decrypt_message(&[]),
            Err(KeyRingError::MalformedMessage(_))
        ));
        assert_eq!(
            admin.decrypt_message(&[9, 1, 2]),
            Err(KeyRingError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_removed_member_cannot_read_after_rekey() {
        let f = fixture();
        let bob = new_user();
        let carol = new_user();
        let mut admin = ring(&f);
        let first = admin
            .rekey(&f.admin_group, &[bob.session_id(), carol.session_id()])
            .unwrap();
        admin.confirm_push(1);

        let mut bob_ring = ring(&f);
        bob_ring
            .load_key_message(&bob, &f.member_group, &first, "h1", 0)
            .unwrap();

        assert!(admin.note_member_removed(&carol.session_id()));
        assert!(admin.needs_rekey(&f.admin_group));
        assert_eq!(
            admin.encrypt_message(&f.admin_user, b"x"),
            Err(KeyRingError::RekeyRequired)
        );

        let mut carol_ring = ring(&f);
        carol_ring
            .load_key_message(&carol, &f.member_group, &first, "h1", 0)
            .unwrap();

        let second = admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        assert!(!admin.needs_rekey(&f.admin_group));
        assert_eq!(
            carol_ring
                .load_key_message(&carol, &f.member_group, &second, "h2", 0)
                .unwrap(),
            KeyLoadOutcome::NotRecipient
        );

        let secret = admin.encrypt_message(&f.admin_user, b"after removal").unwrap();
        assert_eq!(
            carol_ring.decrypt_message(&secret),
            Err(KeyRingError::DecryptionFailed)
        );

        bob_ring
            .load_key_message(&bob, &f.member_group, &second, "h2", 0)
            .unwrap();
        assert_eq!(
            bob_ring.decrypt_message(&secret).unwrap().plaintext,
            b"after removal"
        );
    }

    #[test]
    fn test_removal_of_non_holder_needs_no_rekey() {
        let f = fixture();
        let bob = new_user();
        let carol = new_user();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        assert!(!admin.note_member_removed(&carol.session_id()));
        assert!(!admin.removal_pending());
        assert!(!admin.needs_rekey(&f.admin_group));
    }

    #[test]
    fn test_pending_removal_cleared_by_loaded_key() {
        let f = fixture();
        let bob = new_user();
        let carol = new_user();
        let mut admin = ring(&f);
        let first = admin
            .rekey(&f.admin_group, &[bob.session_id(), carol.session_id()])
            .unwrap();

        let mut member = ring(&f);
        member
            .load_key_message(&bob, &f.member_group, &first, "h1", 0)
            .unwrap();
        assert!(member.note_member_removed(&carol.session_id()));
        assert!(member.encrypt_message(&bob, b"x").is_err());
        // non-admins never report needs_rekey
        assert!(!member.needs_rekey(&f.member_group));

        let second = admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        member
            .load_key_message(&bob, &f.member_group, &second, "h2", 0)
            .unwrap();
        assert!(!member.removal_pending());
        assert!(member.encrypt_message(&bob, b"x").is_ok());
    }

    #[test]
    fn test_newer_key_still_held_by_removed_member_keeps_rekey_pending() {
        let f = fixture();
        let bob = new_user();
        let carol = new_user();
        let device = new_user();
        let both = [bob.session_id(), carol.session_id()];

        let mut a = ring(&f);
        let mut c = ring(&f);
        let base = a.rekey(&f.admin_group, &both).unwrap();
        c.load_key_message(&device, &f.admin_group, &base, "h0", 0)
            .unwrap();

        // a removes carol while c, unaware, rotates for both members
        assert!(a.note_member_removed(&carol.session_id()));
        let stale = c.rekey(&f.admin_group, &both).unwrap();
        a.load_key_message(&device, &f.admin_group, &stale, "h1", 0)
            .unwrap();

        assert_eq!(a.generation(), Some(1));
        assert!(a.removal_pending());
        assert!(a.needs_rekey(&f.admin_group));
        assert_eq!(
            a.encrypt_message(&f.admin_user, b"x"),
            Err(KeyRingError::RekeyRequired)
        );

        a.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        assert_eq!(a.generation(), Some(2));
        assert!(!a.needs_rekey(&f.admin_group));
    }

    #[test]
    fn test_removal_learned_after_key_that_includes_member() {
        let f = fixture();
        let bob = new_user();
        let carol = new_user();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[]).unwrap();
        admin
            .rekey(&f.admin_group, &[bob.session_id(), carol.session_id()])
            .unwrap();
        admin
            .rekey(&f.admin_group, &[bob.session_id(), carol.session_id()])
            .unwrap();

        // however many rotations happened, carol still holds the current key
        assert!(admin.note_member_removed(&carol.session_id()));
        assert!(admin.needs_rekey(&f.admin_group));
    }

    #[test]
    fn test_supplement_records_new_holders() {
        let f = fixture();
        let bob = new_user();
        let dave = new_user();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        let supplement = admin.supplement(&f.admin_group, &[dave.session_id()]).unwrap();

        let mut other_admin = ring(&f);
        let device = new_user();
        other_admin
            .load_key_message(&device, &f.admin_group, &supplement, "s", 0)
            .unwrap();

        assert!(admin.note_member_removed(&dave.session_id()));
        assert!(other_admin.note_member_removed(&dave.session_id()));
    }

    #[test]
    fn test_observed_removals_survive_dump() {
        let f = fixture();
        let carol = new_user();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[carol.session_id()]).unwrap();
        admin.note_member_removed(&carol.session_id());

        let dump = admin.dump().unwrap();
        let restored = KeyRing::from_dump(f.group_public, &dump, KeyRetention::default()).unwrap();
        assert!(restored.removal_pending());
        assert!(restored.needs_rekey(&f.admin_group));
    }

    #[test]
    fn test_concurrent_rekeys_trigger_another() {
        let f = fixture();
        let mut a = ring(&f);
        let mut b = ring(&f);
        let base = a.rekey(&f.admin_group, &[]).unwrap();
        let device = new_user();
        b.load_key_message(&device, &f.admin_group, &base, "h0", 0)
            .unwrap();

        let from_a = a.rekey(&f.admin_group, &[]).unwrap();
        let from_b = b.rekey(&f.admin_group, &[]).unwrap();
        a.load_key_message(&device, &f.admin_group, &from_b, "hb", 0)
            .unwrap();
        b.load_key_message(&device, &f.admin_group, &from_a, "ha", 0)
            .unwrap();

        assert!(a.needs_rekey(&f.admin_group));
        assert_eq!(a.group_keys(), b.group_keys());

        a.rekey(&f.admin_group, &[]).unwrap();
        assert_eq!(a.generation(), Some(2));
        assert!(!a.needs_rekey(&f.admin_group));
    }

    #[test]
    fn test_supplement_hands_over_old_keys() {
        let f = fixture();
        let dave = new_user();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[]).unwrap();
        let old = admin.encrypt_message(&f.admin_user, b"history").unwrap();
        admin.rekey(&f.admin_group, &[]).unwrap();

        let supplement = admin.supplement(&f.admin_group, &[dave.session_id()]).unwrap();
        let mut dave_ring = ring(&f);
        dave_ring
            .load_key_message(&dave, &f.member_group, &supplement, "s", 0)
            .unwrap();
        assert_eq!(dave_ring.generation(), Some(1));
        assert_eq!(dave_ring.group_keys().len(), 2);
        assert_eq!(dave_ring.decrypt_message(&old).unwrap().plaintext, b"history");
    }

    #[test]
    fn test_supplement_requires_keys() {
        let f = fixture();
        let mut admin = ring(&f);
        assert_eq!(
            admin.supplement(&f.admin_group, &[]),
            Err(KeyRingError::NoKeys)
        );
    }

    #[test]
    fn test_push_once() {
        let f = fixture();
        let mut admin = ring(&f);
        let msg = admin.rekey(&f.admin_group, &[]).unwrap();
        let (seqno, data) = admin.pending_push().unwrap();
        assert_eq!(seqno, 1);
        assert_eq!(data, msg);
        admin.confirm_push(seqno);
        assert!(admin.pending_push().is_none());
    }

    #[test]
    fn test_second_unpushed_rekey_carries_both_keys() {
        let f = fixture();
        let bob = new_user();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();
        let (_, pending) = admin.pending_push().unwrap();

        let mut member = ring(&f);
        member
            .load_key_message(&bob, &f.member_group, &pending, "h", 0)
            .unwrap();
        assert_eq!(member.group_keys().len(), 2);
    }

    #[test]
    fn test_prune_superseded_keys() {
        let mut state = KeyRingState::default();
        state.entries = vec![
            entry(0, 0, true),
            entry(1, DAY_MS, true),
            entry(2, 40 * DAY_MS, true),
        ];
        state.prune(30 * DAY_MS);
        // gen 0 superseded at day 1, 39 days before current: dropped
        // gen 1 superseded at day 40, the current key: kept
        let gens: Vec<u64> = state.entries.iter().map(|e| e.generation).collect();
        assert_eq!(gens, vec![1, 2]);
    }

    #[test]
    fn test_prune_keeps_unpushed() {
        let mut state = KeyRingState::default();
        state.entries = vec![entry(0, 0, false), entry(1, 40 * DAY_MS, true)];
        state.prune(30 * DAY_MS);
        assert_eq!(state.entries.len(), 2);
    }

    #[test]
    fn test_expired_keys_not_loaded() {
        let f = fixture();
        let bob = new_user();
        let mut admin = ring(&f);
        let old = admin.rekey(&f.admin_group, &[bob.session_id()]).unwrap();

        // gen 0 would be superseded by gen 5 more than 30 days before gen 7
        let mut member = ring(&f);
        member.state.entries.push(entry(5, now_ms() + DAY_MS, true));
        member.state.entries.push(entry(7, now_ms() + 40 * DAY_MS, true));
        assert_eq!(
            member
                .load_key_message(&bob, &f.member_group, &old, "old", 0)
                .unwrap(),
            KeyLoadOutcome::Expired
        );
        assert_eq!(member.group_keys().len(), 2);
    }

    #[test]
    fn test_rotate_after_policy() {
        let f = fixture();
        let mut admin = KeyRing::new(
            f.group_public,
            KeyRetention {
                rotate_after_ms: Some(0),
                ..Default::default()
            },
        );
        admin.state.entries.push(entry(0, 1, true));
        assert!(admin.needs_rekey(&f.admin_group));
    }

    #[test]
    fn test_dump_roundtrip() {
        let f = fixture();
        let mut admin = ring(&f);
        admin.rekey(&f.admin_group, &[]).unwrap();
        let dump = admin.dump().unwrap();
        assert!(!admin.needs_dump());

        let mut restored =
            KeyRing::from_dump(f.group_public, &dump, KeyRetention::default()).unwrap();
        assert_eq!(restored.group_keys(), admin.group_keys());
        assert!(restored.needs_push());
        assert_eq!(restored.dump().unwrap(), dump);

        let other = fixture();
        assert!(matches!(
            KeyRing::from_dump(other.group_public, &dump, KeyRetention::default()),
            Err(KeyRingError::WrongGroup)
        ));
    }
}
