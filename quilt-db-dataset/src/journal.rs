//! The append-only delta journal
//!
//! Every applied delta (local or remote) gets one journal entry keyed by
//! the clone's local tick at application. Entries chain by hash
//! (`hash = H(prev_hash || canonical(delta))`), so the journal validates
//! every delta's position, and the singleton state row tracks the tail tick
//! and the clone's current causal time.
//!
//! Entries are created once and never modified. Appends are *staged* into
//! the caller's KV batch so they commit atomically with the quad and TID
//! writes of the same transaction; the in-memory state cache is only
//! advanced after the batch commits.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use quilt_db_core::{CompareMode, KvBatch, KvStore, TreeClock};

use crate::error::{DatasetError, Result};
use crate::keys;

/// The journal singleton: tail tick and current causal time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalState {
    /// Tick of the most recent entry
    pub tail_tick: u64,
    /// The clone's current causal time
    pub time: TreeClock,
    /// Hash of the tail entry
    pub last_hash: String,
}

/// One journal entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Local tick at which the delta was applied (the entry key)
    pub tick: u64,
    /// The clone's causal time when the entry was created
    pub local_time: TreeClock,
    /// The originating causal time, for entries applied from a remote delta
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_time: Option<TreeClock>,
    /// The full delta message wire object (`null` for the reset tail entry
    /// written when a snapshot is adopted)
    pub delta: JsonValue,
    /// Chain hash of this entry
    pub hash: String,
    /// Hash of the previous entry
    pub prev: String,
}

impl JournalEntry {
    /// The delta's causal time as it should be re-published: the remote
    /// origin time if this entry came from a peer, the local time otherwise
    pub fn operation_time(&self) -> &TreeClock {
        self.remote_time.as_ref().unwrap_or(&self.local_time)
    }
}

/// Hash of the empty chain start
pub fn genesis_hash() -> String {
    hash_over("", "")
}

fn hash_over(prev: &str, delta_canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(delta_canonical.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    URL_SAFE_NO_PAD.encode(digest)
}

fn canonical_delta(delta: &JsonValue) -> Result<String> {
    serde_json::to_string(delta)
        .map_err(|e| DatasetError::journal(format!("cannot canonicalize delta: {}", e)))
}

/// The per-clone journal
pub struct Journal {
    store: Arc<dyn KvStore>,
    cached: RwLock<Option<JournalState>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("state", &*self.cached.read())
            .finish()
    }
}

impl Journal {
    /// Open the journal, loading persisted state if present
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let cached = match store.get(keys::JOURNAL_KEY).await? {
            Some(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| DatasetError::journal(format!("corrupt journal state: {}", e)))?,
            ),
            None => None,
        };
        Ok(Self {
            store,
            cached: RwLock::new(cached),
        })
    }

    /// Current state, if initialized
    pub fn state(&self) -> Option<JournalState> {
        self.cached.read().clone()
    }

    /// The clone's current causal time, if initialized
    pub fn current_time(&self) -> Option<TreeClock> {
        self.cached.read().as_ref().map(|s| s.time.clone())
    }

    /// Stage the first entry if none exists
    ///
    /// The chain starts at `H("")`; the initial entry carries no delta.
    pub fn stage_initialize(&self, batch: &mut KvBatch, time: &TreeClock) -> Result<JournalState> {
        if self.state().is_some() {
            return Err(DatasetError::journal("journal already initialized"));
        }
        let entry = JournalEntry {
            tick: time.ticks(),
            local_time: time.clone(),
            remote_time: None,
            delta: JsonValue::Null,
            hash: genesis_hash(),
            prev: String::new(),
        };
        let state = JournalState {
            tail_tick: entry.tick,
            time: time.clone(),
            last_hash: entry.hash.clone(),
        };
        self.stage_write(batch, &entry, &state)?;
        Ok(state)
    }

    /// Stage an appended entry onto `state`, returning the entry and the
    /// successor state
    ///
    /// `state` is threaded explicitly so a transaction appending twice (a
    /// remote delta followed by its constraint repair) chains correctly
    /// before anything commits.
    pub fn stage_append(
        &self,
        batch: &mut KvBatch,
        state: &JournalState,
        delta: JsonValue,
        local_time: &TreeClock,
        remote_time: Option<&TreeClock>,
    ) -> Result<(JournalEntry, JournalState)> {
        let tick = local_time.ticks();
        if tick <= state.tail_tick {
            return Err(DatasetError::journal(format!(
                "append at tick {} behind tail {}",
                tick, state.tail_tick
            )));
        }
        let hash = hash_over(&state.last_hash, &canonical_delta(&delta)?);
        let entry = JournalEntry {
            tick,
            local_time: local_time.clone(),
            remote_time: remote_time.cloned(),
            delta,
            hash: hash.clone(),
            prev: state.last_hash.clone(),
        };
        let next = JournalState {
            tail_tick: tick,
            time: local_time.clone(),
            last_hash: hash,
        };
        self.stage_write(batch, &entry, &next)?;
        Ok((entry, next))
    }

    /// Stage a journal reset to an adopted snapshot tail
    ///
    /// The single tail entry carries no delta; its hash is the snapshot's
    /// last hash so later appends continue the producer's chain.
    pub fn stage_reset(
        &self,
        batch: &mut KvBatch,
        last_time: &TreeClock,
        last_hash: &str,
        local_time: &TreeClock,
    ) -> Result<JournalState> {
        let entry = JournalEntry {
            tick: local_time.ticks(),
            local_time: local_time.clone(),
            remote_time: Some(last_time.clone()),
            delta: JsonValue::Null,
            hash: last_hash.to_string(),
            prev: String::new(),
        };
        let state = JournalState {
            tail_tick: entry.tick,
            time: local_time.clone(),
            last_hash: last_hash.to_string(),
        };
        self.stage_write(batch, &entry, &state)?;
        Ok(state)
    }

    /// Stage a bare time update (no entry): the tail and hash stand, only
    /// the current causal time moves
    ///
    /// Used when the clock changes without an event to journal, as when a
    /// fork hands half of our identity to a joiner.
    pub fn stage_time(
        &self,
        batch: &mut KvBatch,
        state: &JournalState,
        time: &TreeClock,
    ) -> Result<JournalState> {
        let next = JournalState {
            tail_tick: state.tail_tick,
            time: time.clone(),
            last_hash: state.last_hash.clone(),
        };
        batch.put(
            keys::JOURNAL_KEY,
            serde_json::to_vec(&next).map_err(quilt_db_core::Error::from)?,
        );
        Ok(next)
    }

    fn stage_write(
        &self,
        batch: &mut KvBatch,
        entry: &JournalEntry,
        state: &JournalState,
    ) -> Result<()> {
        batch.put(
            keys::entry_key(entry.tick),
            serde_json::to_vec(entry).map_err(quilt_db_core::Error::from)?,
        );
        batch.put(
            keys::JOURNAL_KEY,
            serde_json::to_vec(state).map_err(quilt_db_core::Error::from)?,
        );
        Ok(())
    }

    /// Advance the cached state after the enclosing batch committed
    pub fn commit(&self, state: JournalState) {
        *self.cached.write() = Some(state);
    }

    /// Read the entry whose local tick equals `ticks`
    pub async fn find_entry_by_ticks(&self, ticks: u64) -> Result<Option<JournalEntry>> {
        match self.store.get(&keys::entry_key(ticks)).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                DatasetError::journal(format!("corrupt journal entry {}: {}", ticks, e))
            })?)),
        }
    }

    /// Forward-only, restartable walk of entries from `from_tick` to the
    /// current tail, keeping entries whose local time is causally after
    /// `after` (entries the requester has not seen)
    pub fn entries_from(&self, from_tick: u64, after: Option<TreeClock>) -> EntryWalker<'_> {
        let tail = self.state().map(|s| s.tail_tick).unwrap_or(0);
        EntryWalker {
            journal: self,
            next_tick: from_tick,
            tail,
            after,
        }
    }

    /// Re-walk the whole chain, recomputing every hash
    pub async fn verify_chain(&self) -> Result<()> {
        let Some(state) = self.state() else {
            return Ok(());
        };
        let mut prev_hash: Option<String> = None;
        let entries = self.store.scan_prefix(keys::ENTRY_PREFIX).await?;
        for (key, bytes) in entries {
            let entry: JournalEntry = serde_json::from_slice(&bytes)
                .map_err(|e| DatasetError::journal(format!("corrupt entry {}: {}", key, e)))?;
            match (&prev_hash, entry.delta.is_null()) {
                // Chain heads (initial or reset entries) carry their hash.
                (None, _) => {}
                (Some(prev), false) => {
                    let expect = hash_over(prev, &canonical_delta(&entry.delta)?);
                    if expect != entry.hash || entry.prev != *prev {
                        return Err(DatasetError::journal(format!(
                            "hash chain broken at tick {}",
                            entry.tick
                        )));
                    }
                }
                (Some(_), true) => {
                    return Err(DatasetError::journal(format!(
                        "unexpected empty delta mid-chain at tick {}",
                        entry.tick
                    )));
                }
            }
            prev_hash = Some(entry.hash);
        }
        match prev_hash {
            Some(last) if last == state.last_hash => Ok(()),
            Some(_) => Err(DatasetError::journal("tail hash does not match state")),
            None => Err(DatasetError::journal("journal state without entries")),
        }
    }
}

/// Lazy forward walk over journal entries
///
/// Finite: stops at the tail captured at creation. Restartable: recreate
/// with the last seen tick + 1.
pub struct EntryWalker<'a> {
    journal: &'a Journal,
    next_tick: u64,
    tail: u64,
    after: Option<TreeClock>,
}

impl EntryWalker<'_> {
    /// The next matching entry, or `None` at the tail
    pub async fn next(&mut self) -> Result<Option<JournalEntry>> {
        while self.next_tick <= self.tail {
            let tick = self.next_tick;
            self.next_tick += 1;
            let Some(entry) = self.journal.find_entry_by_ticks(tick).await? else {
                continue;
            };
            if entry.delta.is_null() {
                continue;
            }
            if let Some(after) = &self.after {
                if !after.any_lt(&entry.local_time, CompareMode::IncludeIds) {
                    continue;
                }
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }
}
