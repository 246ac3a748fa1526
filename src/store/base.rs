/// The generic merged config store.
///
/// Holds one state value plus the bookkeeping every store shares: a lamport
/// clock (the high-water mark of every timestamp seen, persisted in the
/// dump), the push sequence number, and the push / dump dirty flags.
///
/// Local writes go through [`ConfigStore::mutate`], which works on a copy and
/// only commits when the closure succeeds, so a rejected edit never leaves a
/// partial change behind.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::{cbor_decode, cbor_encode, decode_dump, encode_dump, Result, StoreKind};

/// A store's mergeable state.
pub trait ConfigState: Clone + PartialEq + Default + Serialize + DeserializeOwned {
    const KIND: StoreKind;

    /// Fold `other` into `self`. Must be commutative, associative and
    /// idempotent.
    fn merge(&mut self, other: &Self);
}

/// What a push carries: the state plus the sender's clock and seqno.
#[derive(Serialize, Deserialize)]
struct PushPayload<S> {
    seqno: u64,
    clock: u64,
    state: S,
}

/// What a dump carries.
#[derive(Serialize, Deserialize)]
struct Snapshot<S> {
    clock: u64,
    seqno: u64,
    needs_push: bool,
    state: S,
}

#[derive(Clone, Debug)]
pub struct ConfigStore<S> {
    state: S,
    clock: u64,
    seqno: u64,
    needs_push: bool,
    needs_dump: bool,
    read_only: bool,
}

impl<S: ConfigState> Default for ConfigStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConfigState> ConfigStore<S> {
    pub fn new() -> Self {
        ConfigStore {
            state: S::default(),
            clock: 0,
            seqno: 0,
            needs_push: false,
            needs_dump: false,
            read_only: false,
        }
    }

    /// Restore from a dump produced by [`ConfigStore::dump`].
    pub fn from_dump(data: &[u8]) -> Result<Self> {
        let snapshot: Snapshot<S> = decode_dump(S::KIND, data)?;
        Ok(ConfigStore {
            state: snapshot.state,
            clock: snapshot.clock,
            seqno: snapshot.seqno,
            needs_push: snapshot.needs_push,
            needs_dump: false,
            read_only: false,
        })
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn needs_push(&self) -> bool {
        self.needs_push
    }

    pub fn needs_dump(&self) -> bool {
        self.needs_dump
    }

    /// A read-only store merges but never schedules a push of its own.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
        if read_only {
            self.needs_push = false;
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Apply a local edit stamped with the next clock value.
    ///
    /// The closure sees a copy of the state; nothing is committed on error.
    /// Returns the closure's value and whether the state changed.
    pub fn mutate<R, E, F>(&mut self, edit: F) -> std::result::Result<(R, bool), E>
    where
        F: FnOnce(&mut S, u64) -> std::result::Result<R, E>,
    {
        let ts = self.clock + 1;
        let mut next = self.state.clone();
        let out = edit(&mut next, ts)?;
        let changed = next != self.state;
        if changed {
            self.state = next;
            self.clock = ts;
            self.needs_push = !self.read_only;
            self.needs_dump = true;
        }
        Ok((out, changed))
    }

    /// The payload to push, if any, with the seqno it will carry.
    ///
    /// Nothing changes until [`ConfigStore::confirm_push`] is called.
    pub fn pending_push(&self) -> Result<Option<(u64, Vec<u8>)>> {
        if !self.needs_push {
            return Ok(None);
        }
        let seqno = self.seqno + 1;
        let payload = cbor_encode(&PushPayload {
            seqno,
            clock: self.clock,
            state: &self.state,
        })?;
        Ok(Some((seqno, payload)))
    }

    /// Mark the payload returned by `pending_push` as handed to the transport.
    pub fn confirm_push(&mut self, seqno: u64) {
        self.seqno = self.seqno.max(seqno);
        self.needs_push = false;
        self.needs_dump = true;
    }

    /// Merge a payload produced by another writer's `pending_push`.
    ///
    /// Returns true when the visible state changed. When the merged result
    /// differs from what the sender has, this store schedules a push so the
    /// other writers converge too.
    pub fn merge_payload(&mut self, payload: &[u8]) -> Result<bool> {
        let remote: PushPayload<S> = cbor_decode(payload)?;

        let before = self.state.clone();
        self.state.merge(&remote.state);
        let changed = self.state != before;

        let clock = self.clock.max(remote.clock);
        let seqno = self.seqno.max(remote.seqno);
        if clock != self.clock || seqno != self.seqno || changed {
            self.needs_dump = true;
        }
        self.clock = clock;
        self.seqno = seqno;

        if changed && self.state != remote.state && !self.read_only {
            self.needs_push = true;
        }
        Ok(changed)
    }

    /// Serialize a snapshot and clear the dump flag.
    pub fn dump(&mut self) -> Result<Vec<u8>> {
        let data = self.snapshot()?;
        self.needs_dump = false;
        Ok(data)
    }

    /// Serialize a snapshot without touching the dump flag.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        encode_dump(
            S::KIND,
            &Snapshot {
                clock: self.clock,
                seqno: self.seqno,
                needs_push: self.needs_push,
                state: &self.state,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
