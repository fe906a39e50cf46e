//! Debounce timers and the per-document flush state machine.
//!
//! Timers are plain deadlines; nothing here sleeps. The session polls them
//! from `tick` with the current time, which keeps every transition
//! deterministic under a manual clock.

use crate::document::DocumentType;
use crate::fingerprint::Fingerprint;
use crate::owner::OwnerId;
use serde::Serialize;

/// A restartable one-shot deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebounceTimer {
    delay_ms: u64,
    deadline: Option<u64>,
}

impl DebounceTimer {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            deadline: None,
        }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Arms (or re-arms) the timer to fire `delay_ms` after `now_ms`.
    pub fn reset(&mut self, now_ms: u64) {
        self.deadline = Some(now_ms.saturating_add(self.delay_ms));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.deadline.is_some_and(|d| d <= now_ms)
    }

    /// Time left until the deadline, if armed.
    pub fn remaining(&self, now_ms: u64) -> Option<u64> {
        self.deadline.map(|d| d.saturating_sub(now_ms))
    }

    /// Disarms and returns true if the deadline has passed.
    pub fn fire(&mut self, now_ms: u64) -> bool {
        if self.is_due(now_ms) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushState {
    /// Nothing owed to the remote.
    Idle,
    /// Local content the remote has not confirmed yet.
    Dirty,
    /// A save is in flight and nothing changed since it was sent.
    Pending,
}

/// Identifies one remote save so its completion can be matched up later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTicket {
    pub doc_type: DocumentType,
    pub owner: OwnerId,
    pub epoch: u64,
    pub generation: u64,
}

/// Timers and bookkeeping for one document type.
#[derive(Debug, Clone)]
pub struct DocScheduler {
    pub persist: DebounceTimer,
    pub broadcast: DebounceTimer,
    pub retry: DebounceTimer,
    /// Bumped by every local edit.
    generation: u64,
    /// Bumped by owner changes and clears; completions from older epochs are stale.
    epoch: u64,
    dirty: bool,
    /// Save in flight, with the fingerprint of what was sent.
    in_flight: Option<(SaveTicket, Fingerprint)>,
    /// A flush was requested while a save was in flight.
    follow_up: bool,
    last_flushed: Option<Fingerprint>,
    last_broadcast: Option<Fingerprint>,
}

impl DocScheduler {
    pub fn new(persist_ms: u64, broadcast_ms: u64, retry_ms: u64) -> Self {
        Self {
            persist: DebounceTimer::new(persist_ms),
            broadcast: DebounceTimer::new(broadcast_ms),
            retry: DebounceTimer::new(retry_ms),
            generation: 0,
            epoch: 0,
            dirty: false,
            in_flight: None,
            follow_up: false,
            last_flushed: None,
            last_broadcast: None,
        }
    }

    pub fn state(&self) -> FlushState {
        match (self.dirty, self.in_flight.is_some()) {
            (true, _) => FlushState::Dirty,
            (false, true) => FlushState::Pending,
            (false, false) => FlushState::Idle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn last_flushed(&self) -> Option<Fingerprint> {
        self.last_flushed
    }

    pub fn last_broadcast(&self) -> Option<Fingerprint> {
        self.last_broadcast
    }

    /// Local edit: `Idle|Pending -> Dirty`, both debounce timers restart.
    pub fn note_edit(&mut self, now_ms: u64) {
        self.generation += 1;
        self.dirty = true;
        self.persist.reset(now_ms);
        self.broadcast.reset(now_ms);
    }

    /// Marks content as owed to the remote without counting as an edit.
    pub fn mark_dirty(&mut self, now_ms: u64) {
        self.dirty = true;
        self.persist.reset(now_ms);
    }

    /// Nothing is owed; used where there is no remote to owe it to.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
        self.persist.cancel();
    }

    /// Content now matches what other copies hold (applied from another tab
    /// or from the remote). Pending timers are dropped.
    pub fn settle(&mut self, fp: Fingerprint) {
        self.dirty = false;
        self.follow_up = false;
        self.persist.cancel();
        self.broadcast.cancel();
        self.last_broadcast = Some(fp);
    }

    pub fn record_flushed(&mut self, fp: Fingerprint) {
        self.last_flushed = Some(fp);
    }

    pub fn record_broadcast(&mut self, fp: Fingerprint) {
        self.last_broadcast = Some(fp);
        self.broadcast.cancel();
    }

    /// Whether content with fingerprint `fp` still has to be sent.
    pub fn owes_save(&self, fp: &Fingerprint) -> bool {
        self.dirty && !self.last_flushed.is_some_and(|last| last.matches(fp))
    }

    /// Drops a dirty flag whose content the remote already has.
    pub fn clear_if_flushed(&mut self, fp: &Fingerprint) {
        if self.last_flushed.is_some_and(|last| last.matches(fp)) {
            self.dirty = false;
        }
    }

    /// Starts a save. Returns `None` (and remembers the request) when one is
    /// already in flight.
    pub fn begin_save(&mut self, owner: &OwnerId, doc_type: DocumentType, fp: Fingerprint) -> Option<SaveTicket> {
        if self.in_flight.is_some() {
            self.follow_up = true;
            return None;
        }
        let ticket = SaveTicket {
            doc_type,
            owner: owner.clone(),
            epoch: self.epoch,
            generation: self.generation,
        };
        self.in_flight = Some((ticket.clone(), fp));
        self.dirty = false;
        self.follow_up = false;
        self.persist.cancel();
        self.retry.cancel();
        Some(ticket)
    }

    /// Finishes the in-flight save. Returns `None` for stale tickets, else
    /// whether a follow-up flush was requested meanwhile.
    pub fn finish_save(&mut self, ticket: &SaveTicket, succeeded: bool, now_ms: u64) -> Option<bool> {
        let (_, fp) = self.in_flight.take_if(|(t, _)| *t == *ticket)?;
        if succeeded {
            self.last_flushed = Some(fp);
        } else {
            self.dirty = true;
            self.retry.reset(now_ms);
        }
        Some(std::mem::take(&mut self.follow_up))
    }

    /// Starts a new epoch: in-flight work becomes stale, timers stop and
    /// nothing is owed. Returns the epoch that just ended.
    pub fn next_epoch(&mut self) -> u64 {
        let ended = self.epoch;
        self.epoch += 1;
        self.dirty = false;
        self.in_flight = None;
        self.follow_up = false;
        self.last_flushed = None;
        self.last_broadcast = None;
        self.persist.cancel();
        self.broadcast.cancel();
        self.retry.cancel();
        ended
    }
}
