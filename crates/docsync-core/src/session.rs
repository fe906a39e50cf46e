//! The per-tab sync session.
//!
//! `SyncSession` ties the durable store, the tab channel, the schedulers and
//! the reconciliation guards together for one owner at a time. It never
//! performs remote I/O itself: work for the remote store is queued as
//! `RemoteCommand`s (drained with `take_commands`) and the results are fed
//! back through `complete_load`, `complete_save` and `complete_delete`.
//! `SyncDriver` does that loop for async hosts.
//!
//! Time only moves when the host calls `tick`, which fires due timers and
//! processes messages from other tabs.

use crate::broadcast::{BroadcastEnvelope, ChannelMode, Incoming, Subscription, TabChannel, TabId};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::document::{DocumentContent, DocumentType, NoteContent, PerType, TaskEdit};
use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;
use crate::keys::StorageKey;
use crate::owner::OwnerId;
use crate::reconcile::{self, PeerDecision, RemoteDecision};
use crate::remote::{self, LoadOutcome, RemoteId};
use crate::scheduler::{DocScheduler, SaveTicket};
use crate::state::{DocStatus, SaveStatus, SyncState};
use crate::store::{KvBackend, LocalStore};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// Host lifecycle signals that force an immediate flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The page lost visibility.
    Hidden,
    /// The page is about to unload.
    Unloading,
    PanelClosed(DocumentType),
    ManualSave(DocumentType),
}

impl LifecycleEvent {
    fn doc_types(&self) -> Vec<DocumentType> {
        match self {
            LifecycleEvent::Hidden | LifecycleEvent::Unloading => DocumentType::ALL.to_vec(),
            LifecycleEvent::PanelClosed(ty) | LifecycleEvent::ManualSave(ty) => vec![*ty],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPurpose {
    Login,
    Refresh,
    Staleness,
}

/// Identifies one remote load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub doc_type: DocumentType,
    pub owner: OwnerId,
    pub epoch: u64,
    /// Edit generation the load was first requested at; on a refresh, edits
    /// after it keep local content.
    pub generation: u64,
    pub purpose: LoadPurpose,
}

/// Remote work for the host to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    Load(LoadTicket),
    Save {
        ticket: SaveTicket,
        content: DocumentContent,
        existing: Option<RemoteId>,
    },
    Delete {
        owner: OwnerId,
        doc_type: DocumentType,
        remote_id: RemoteId,
    },
}

struct DocSlot {
    content: DocumentContent,
    remote_id: Option<RemoteId>,
    scheduler: DocScheduler,
    sync: SyncState,
    save: SaveStatus,
    load: Option<LoadTicket>,
    /// A failed load to reissue on the retry timer, with its original generation.
    load_owed: Option<(LoadPurpose, u64)>,
    /// A save was requested while a load was in flight.
    save_after_load: bool,
    last_fetched_ms: Option<u64>,
    /// Epoch ended by the last clear and the remote id it deleted.
    cleared: Option<(u64, Option<RemoteId>)>,
    last_signal_ms: Option<u64>,
    signal_deferred: bool,
}

impl DocSlot {
    fn new(ty: DocumentType, config: &SyncConfig) -> Self {
        let persist_ms = match ty {
            DocumentType::TaskList => config.task_idle_ms,
            DocumentType::Note => config.note_idle_ms,
        };
        Self {
            content: DocumentContent::empty(ty),
            remote_id: None,
            scheduler: DocScheduler::new(persist_ms, config.broadcast_delay_ms, config.retry_delay_ms),
            sync: SyncState::default(),
            save: SaveStatus::default(),
            load: None,
            load_owed: None,
            save_after_load: false,
            last_fetched_ms: None,
            cleared: None,
            last_signal_ms: None,
            signal_deferred: false,
        }
    }

    /// Starts over with `content` for a new owner. Epoch counters survive so
    /// completions for the previous owner stay recognisably stale.
    fn reset(&mut self, content: DocumentContent, now_ms: u64) {
        self.scheduler.next_epoch();
        if let Some(fp) = fingerprint(&content, now_ms) {
            self.scheduler.settle(fp);
        }
        self.content = content;
        self.remote_id = None;
        self.sync = SyncState::default();
        self.save = SaveStatus::default();
        self.load = None;
        self.load_owed = None;
        self.save_after_load = false;
        self.last_fetched_ms = None;
        self.cleared = None;
        self.last_signal_ms = None;
        self.signal_deferred = false;
    }

    fn update_syncing(&mut self) {
        self.sync.syncing = self.load.is_some() || self.scheduler.in_flight();
    }
}

fn fingerprint(content: &DocumentContent, now_ms: u64) -> Option<Fingerprint> {
    content
        .to_canonical_json()
        .ok()
        .map(|canonical| Fingerprint::of(&canonical, now_ms))
}

/// Sync state of one tab.
pub struct SyncSession<B> {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    store: LocalStore<B>,
    channel: Box<dyn TabChannel>,
    inbox: Arc<Mutex<VecDeque<Incoming>>>,
    _subscription: Subscription,
    owner: Option<OwnerId>,
    docs: PerType<DocSlot>,
    commands: VecDeque<RemoteCommand>,
    /// Newest envelope timestamp seen per sending tab.
    origins: HashMap<TabId, u64>,
}

impl<B: KvBackend> SyncSession<B> {
    pub fn new(config: SyncConfig, clock: Arc<dyn Clock>, backend: B, channel: Box<dyn TabChannel>) -> Self {
        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        let sink = Arc::clone(&inbox);
        let subscription = channel.subscribe(Arc::new(move |message| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push_back(message);
        }));
        let store = LocalStore::new(backend, config.key_prefix.clone());
        let docs = PerType::new(|ty| DocSlot::new(ty, &config));

        debug!("Opened session for tab {} ({:?})", channel.tab_id(), channel.mode());
        Self {
            config,
            clock,
            store,
            channel,
            inbox,
            _subscription: subscription,
            owner: None,
            docs,
            commands: VecDeque::new(),
            origins: HashMap::new(),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        self.owner.as_ref()
    }

    pub fn tab_id(&self) -> &TabId {
        self.channel.tab_id()
    }

    pub fn channel_mode(&self) -> ChannelMode {
        self.channel.mode()
    }

    pub fn store(&self) -> &LocalStore<B> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Switches the session to `owner`. Setting the current owner again is a
    /// no-op.
    ///
    /// Unsaved edits of the previous owner are persisted and sent first. The
    /// new owner's documents are read from the durable store (recovering from
    /// the backup copy if needed) and, for non-anonymous owners, loaded from
    /// the remote.
    pub fn set_owner(&mut self, owner: OwnerId) {
        if self.owner.as_ref() == Some(&owner) {
            trace!("Owner {} already set", owner);
            return;
        }
        self.release_owner();

        let now = self.now();
        self.owner = Some(owner.clone());
        self.origins.clear();
        info!("Session owner set to {}", owner);

        for ty in DocumentType::ALL {
            if !owner.is_anonymous() {
                match self.store.adopt(&OwnerId::anonymous(), &owner, ty, now) {
                    Ok(true) => info!("Adopted anonymous {} for {}", ty, owner),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to adopt anonymous {} for {}: {}", ty, owner, e),
                }
            }
            let stale = reconcile::is_stale(self.store.timestamp(&owner, ty), now, self.config.staleness_window_ms);
            let content = self.read_local(&owner, ty, now);
            self.docs.get_mut(ty).reset(content, now);

            if !owner.is_anonymous() {
                let purpose = if stale {
                    LoadPurpose::Staleness
                } else {
                    LoadPurpose::Login
                };
                self.issue_load(&owner, ty, purpose, None);
            }
        }
    }

    /// Detaches the session from its owner. Unsaved edits are persisted and
    /// sent first; afterwards every operation fails with `NoOwner`.
    pub fn clear_owner(&mut self) {
        if self.owner.is_none() {
            return;
        }
        self.release_owner();
        let now = self.now();
        for ty in DocumentType::ALL {
            self.docs.get_mut(ty).reset(DocumentContent::empty(ty), now);
        }
        self.origins.clear();
        info!("Session owner cleared");
    }

    fn release_owner(&mut self) {
        if let Some(owner) = self.owner.clone() {
            for ty in DocumentType::ALL {
                if self.docs.get(ty).scheduler.is_dirty() {
                    debug!("Flushing {} for outgoing owner {}", ty, owner);
                    self.flush(&owner, ty);
                }
            }
        }
        self.owner = None;
    }

    /// Primary copy, unless a non-empty backup disagrees with it (a write
    /// interrupted between the two copies).
    fn read_local(&self, owner: &OwnerId, ty: DocumentType, now_ms: u64) -> DocumentContent {
        let primary = self.store.read(owner, ty, now_ms);
        match self.store.read_backup(owner, ty, now_ms) {
            Some(backup) if !backup.is_empty() && backup != primary => {
                warn!("Recovering {} for {} from backup copy", ty, owner);
                if let Err(e) = self.store.write(owner, &backup, now_ms) {
                    warn!("Failed to rewrite recovered {} for {}: {}", ty, owner, e);
                }
                backup
            }
            _ => primary,
        }
    }

    fn require_owner(&self) -> Result<OwnerId> {
        self.owner.clone().ok_or(SyncError::NoOwner)
    }

    /// Replaces the document of `content`'s type. Identical content is ignored.
    pub fn edit(&mut self, content: DocumentContent) -> Result<()> {
        self.require_owner()?;
        self.apply_edit(content);
        Ok(())
    }

    /// Like `edit`, for callers that name the owner they believe is current.
    pub fn edit_for(&mut self, owner: &OwnerId, content: DocumentContent) -> Result<()> {
        reconcile::check_owner(self.owner.as_ref(), owner)?;
        self.apply_edit(content);
        Ok(())
    }

    /// Returns whether the task list changed.
    pub fn edit_tasks(&mut self, edit: TaskEdit) -> Result<bool> {
        self.require_owner()?;
        let now = self.now();
        let mut tasks = self
            .docs
            .get(DocumentType::TaskList)
            .content
            .as_tasks()
            .map(|tasks| tasks.to_vec())
            .unwrap_or_default();
        if !edit.apply(&mut tasks, now) {
            return Ok(false);
        }
        Ok(self.apply_edit(DocumentContent::Tasks(tasks)))
    }

    pub fn set_note(&mut self, text: impl Into<String>) -> Result<()> {
        self.require_owner()?;
        let mut note = self.current_note();
        note.notes = text.into();
        self.apply_edit(DocumentContent::Note(note));
        Ok(())
    }

    pub fn set_transcription(&mut self, text: impl Into<String>) -> Result<()> {
        self.require_owner()?;
        let mut note = self.current_note();
        note.transcription = text.into();
        self.apply_edit(DocumentContent::Note(note));
        Ok(())
    }

    fn current_note(&self) -> NoteContent {
        self.docs
            .get(DocumentType::Note)
            .content
            .as_note()
            .cloned()
            .unwrap_or_default()
    }

    fn apply_edit(&mut self, content: DocumentContent) -> bool {
        let now = self.now();
        let slot = self.docs.get_mut(content.doc_type());
        if slot.content == content {
            return false;
        }
        slot.content = content;
        slot.scheduler.note_edit(now);
        true
    }

    /// Persists, broadcasts and sends `ty` now, bypassing the debounce timers.
    pub fn request_flush(&mut self, ty: DocumentType) -> Result<()> {
        let owner = self.require_owner()?;
        self.flush(&owner, ty);
        Ok(())
    }

    pub fn lifecycle(&mut self, event: LifecycleEvent) {
        let Some(owner) = self.owner.clone() else {
            return;
        };
        debug!("Lifecycle {:?}", event);
        for ty in event.doc_types() {
            self.flush(&owner, ty);
        }
    }

    fn flush(&mut self, owner: &OwnerId, ty: DocumentType) {
        self.write_local(owner, ty);
        self.publish_update(owner, ty);
        self.docs.get_mut(ty).scheduler.persist.cancel();
        self.send_save(owner, ty);
    }

    fn write_local(&mut self, owner: &OwnerId, ty: DocumentType) {
        let now = self.now();
        let slot = self.docs.get_mut(ty);
        match self.store.write(owner, &slot.content, now) {
            Ok(_) => {
                slot.save.last_saved_at = Some(now);
                slot.save.last_error = None;
            }
            Err(e) => {
                warn!("Local save of {} for {} failed: {}", ty, owner, e);
                slot.save.last_error = Some(e.into());
            }
        }
    }

    fn publish_update(&mut self, owner: &OwnerId, ty: DocumentType) {
        let now = self.now();
        let slot = self.docs.get_mut(ty);
        let Some(fp) = fingerprint(&slot.content, now) else {
            return;
        };
        if slot.scheduler.last_broadcast().is_some_and(|last| last.matches(&fp)) {
            slot.scheduler.broadcast.cancel();
            return;
        }
        let envelope = match BroadcastEnvelope::updated(owner, &slot.content, self.channel.tab_id(), now) {
            Ok(envelope) => envelope.with_remote_id(slot.remote_id.clone()),
            Err(e) => {
                warn!("Failed to build {} envelope: {}", ty, e);
                return;
            }
        };
        match self.channel.publish(&envelope) {
            Ok(()) => slot.scheduler.record_broadcast(fp),
            Err(e) => warn!("Broadcast of {} failed: {}", ty, e),
        }
    }

    fn send_save(&mut self, owner: &OwnerId, ty: DocumentType) {
        let now = self.now();
        let slot = self.docs.get_mut(ty);
        if owner.is_anonymous() {
            slot.scheduler.mark_clean();
            return;
        }
        if slot.load.is_some() {
            debug!("Deferring {} save until the load completes", ty);
            slot.save_after_load = true;
            return;
        }
        let fp = match slot.content.to_canonical_json() {
            Ok(canonical) => Fingerprint::of(&canonical, now),
            Err(e) => {
                slot.sync.last_error = Some(SyncError::Serialization(e.to_string()));
                return;
            }
        };
        if !slot.scheduler.owes_save(&fp) {
            slot.scheduler.clear_if_flushed(&fp);
            return;
        }
        let Some(ticket) = slot.scheduler.begin_save(owner, ty, fp) else {
            debug!("{} save already in flight, following up afterwards", ty);
            return;
        };
        debug!("Saving {} for {} (generation {})", ty, owner, ticket.generation);
        slot.update_syncing();
        self.commands.push_back(RemoteCommand::Save {
            ticket,
            content: slot.content.clone(),
            existing: slot.remote_id.clone(),
        });
    }

    fn issue_load(&mut self, owner: &OwnerId, ty: DocumentType, purpose: LoadPurpose, generation: Option<u64>) {
        let slot = self.docs.get_mut(ty);
        if slot.load.is_some() {
            return;
        }
        let ticket = LoadTicket {
            doc_type: ty,
            owner: owner.clone(),
            epoch: slot.scheduler.epoch(),
            generation: generation.unwrap_or_else(|| slot.scheduler.generation()),
            purpose,
        };
        debug!("Loading {} for {} ({:?})", ty, owner, purpose);
        slot.load = Some(ticket.clone());
        slot.update_syncing();
        self.commands.push_back(RemoteCommand::Load(ticket));
    }

    /// Processes messages from other tabs and fires every due timer.
    pub fn tick(&mut self) {
        self.drain_inbox();
        let Some(owner) = self.owner.clone() else {
            return;
        };
        let now = self.now();
        for ty in DocumentType::ALL {
            let scheduler = &mut self.docs.get_mut(ty).scheduler;
            let persist_due = scheduler.persist.fire(now);
            let broadcast_due = !persist_due && scheduler.broadcast.fire(now);
            let retry_due = scheduler.retry.fire(now);
            if persist_due {
                self.flush(&owner, ty);
            } else if broadcast_due {
                self.write_local(&owner, ty);
                self.publish_update(&owner, ty);
            }
            if retry_due {
                self.retry(&owner, ty);
            }

            let slot = self.docs.get_mut(ty);
            let window_over = slot
                .last_signal_ms
                .is_some_and(|at| now.saturating_sub(at) >= self.config.signal_dedupe_ms);
            if slot.signal_deferred && window_over {
                slot.signal_deferred = false;
                slot.last_signal_ms = Some(now);
                self.reread_store(&owner, ty);
            }

            self.check_staleness(&owner, ty, now);
        }
    }

    fn retry(&mut self, owner: &OwnerId, ty: DocumentType) {
        let slot = self.docs.get_mut(ty);
        let owed_load = slot.load_owed.take();
        let dirty = slot.scheduler.is_dirty();
        if let Some((purpose, generation)) = owed_load {
            debug!("Retrying {} load", ty);
            self.issue_load(owner, ty, purpose, Some(generation));
        } else if dirty {
            debug!("Retrying {} save", ty);
            self.send_save(owner, ty);
        }
    }

    /// Re-fetches content not written or fetched within the staleness window.
    fn check_staleness(&mut self, owner: &OwnerId, ty: DocumentType, now_ms: u64) {
        if owner.is_anonymous() {
            return;
        }
        let window = self.config.staleness_window_ms;
        let slot = self.docs.get(ty);
        if slot.load.is_some() || slot.load_owed.is_some() || slot.scheduler.is_dirty() {
            return;
        }
        let fetched_recently = slot
            .last_fetched_ms
            .is_some_and(|at| !reconcile::is_stale(Some(at), now_ms, window));
        if !fetched_recently && reconcile::is_stale(self.store.timestamp(owner, ty), now_ms, window) {
            info!("Local {} for {} is stale, re-fetching", ty, owner);
            self.issue_load(owner, ty, LoadPurpose::Staleness, None);
        }
    }

    pub fn complete_load(&mut self, ticket: LoadTicket, result: remote::Result<LoadOutcome>) {
        let now = self.now();
        let ty = ticket.doc_type;
        let slot = self.docs.get_mut(ty);
        if slot.load.as_ref() != Some(&ticket) {
            debug!("Discarding stale {} load for {}", ty, ticket.owner);
            return;
        }
        slot.load = None;
        slot.update_syncing();

        match result {
            Err(e) => {
                let err = SyncError::from(e);
                warn!("Loading {} for {} failed: {}", ty, ticket.owner, err);
                if err.is_retryable() {
                    slot.load_owed = Some((ticket.purpose, ticket.generation));
                    slot.scheduler.retry.reset(now);
                }
                slot.sync.last_error = Some(err);
            }
            Ok(outcome) => {
                slot.load_owed = None;
                slot.last_fetched_ms = Some(now);
                slot.sync.last_sync_at = Some(now);
                slot.sync.last_error = None;

                let remote = match outcome {
                    LoadOutcome::Found(doc) => {
                        if doc.remote_id.is_some() {
                            slot.remote_id = doc.remote_id;
                        }
                        Some(doc.content)
                    }
                    LoadOutcome::NotFound => None,
                };
                // Login and staleness loads bring the remote copy in as is;
                // only a user-requested refresh yields to edits made meanwhile.
                let edited = ticket.purpose == LoadPurpose::Refresh
                    && slot.scheduler.generation() != ticket.generation;
                match reconcile::decide_remote(&slot.content, remote.as_ref(), edited) {
                    RemoteDecision::Replace => {
                        if let Some(content) = remote {
                            info!("Replacing local {} with remote copy", ty);
                            self.apply_remote(&ticket.owner, content);
                        }
                    }
                    RemoteDecision::InSync => {
                        if let Some(fp) = fingerprint(&slot.content, now) {
                            slot.scheduler.record_flushed(fp);
                            slot.scheduler.clear_if_flushed(&fp);
                        }
                    }
                    RemoteDecision::KeepLocal { owes_save, reason } => {
                        debug!("Keeping local {} ({:?})", ty, reason);
                        if owes_save {
                            slot.scheduler.mark_dirty(now);
                            slot.save_after_load = true;
                        }
                    }
                }
            }
        }

        if std::mem::take(&mut self.docs.get_mut(ty).save_after_load) {
            self.send_save(&ticket.owner, ty);
        }
    }

    /// Takes remote content as the new local state; the remote already has it.
    fn apply_remote(&mut self, owner: &OwnerId, content: DocumentContent) {
        let now = self.now();
        let ty = content.doc_type();
        let slot = self.docs.get_mut(ty);
        if let Some(fp) = fingerprint(&content, now) {
            slot.scheduler.record_flushed(fp);
        }
        slot.content = content;
        slot.scheduler.mark_clean();
        self.write_local(owner, ty);
        self.publish_update(owner, ty);
    }

    pub fn complete_save(&mut self, ticket: SaveTicket, result: remote::Result<RemoteId>) {
        let now = self.now();
        let ty = ticket.doc_type;
        let succeeded = result.is_ok();
        let slot = self.docs.get_mut(ty);

        let Some(follow_up) = slot.scheduler.finish_save(&ticket, succeeded, now) else {
            // A save that raced a clear may have created a record nobody
            // knows about any more.
            let orphan = match (&result, &slot.cleared) {
                (Ok(id), Some((epoch, deleted))) if *epoch == ticket.epoch && deleted.as_ref() != Some(id) => {
                    Some(id.clone())
                }
                _ => None,
            };
            if let Some(remote_id) = orphan.filter(|_| self.owner.as_ref() == Some(&ticket.owner)) {
                info!("Deleting remote {} {} saved during clear", ty, remote_id);
                self.commands.push_back(RemoteCommand::Delete {
                    owner: ticket.owner,
                    doc_type: ty,
                    remote_id,
                });
            } else {
                debug!("Discarding stale {} save for {}", ty, ticket.owner);
            }
            return;
        };
        slot.update_syncing();

        match result {
            Ok(remote_id) => {
                debug!("Saved {} for {} as {}", ty, ticket.owner, remote_id);
                slot.remote_id = Some(remote_id);
                slot.sync.last_sync_at = Some(now);
                slot.sync.last_error = None;
            }
            Err(e) => {
                let err = SyncError::from(e);
                warn!("Saving {} for {} failed: {}", ty, ticket.owner, err);
                if !err.is_retryable() {
                    slot.scheduler.retry.cancel();
                }
                slot.sync.last_error = Some(err);
            }
        }

        if succeeded && follow_up && slot.scheduler.is_dirty() {
            self.send_save(&ticket.owner, ty);
        }
    }

    pub fn complete_delete(&mut self, owner: &OwnerId, ty: DocumentType, result: remote::Result<()>) {
        match result {
            Ok(()) => debug!("Deleted remote {} for {}", ty, owner),
            Err(e) => {
                let err = SyncError::from(e);
                warn!("Deleting remote {} for {} failed: {}", ty, owner, err);
                if self.owner.as_ref() == Some(owner) {
                    self.docs.get_mut(ty).sync.last_error = Some(err);
                }
            }
        }
    }

    /// Empties `ty` locally, in other tabs and on the remote.
    pub fn clear(&mut self, ty: DocumentType) -> Result<()> {
        let owner = self.require_owner()?;
        let now = self.now();
        let slot = self.docs.get_mut(ty);
        let remote_id = slot.remote_id.take();
        let ended = slot.scheduler.next_epoch();
        slot.cleared = Some((ended, remote_id.clone()));
        slot.content = DocumentContent::empty(ty);
        slot.load = None;
        slot.load_owed = None;
        slot.save_after_load = false;
        slot.signal_deferred = false;
        slot.update_syncing();
        if let Some(fp) = fingerprint(&slot.content, now) {
            slot.scheduler.settle(fp);
        }

        match self.store.clear(&owner, ty) {
            Ok(()) => slot.save.last_saved_at = Some(now),
            Err(e) => {
                warn!("Failed to clear local {} for {}: {}", ty, owner, e);
                slot.save.last_error = Some(e.into());
            }
        }

        let envelope = BroadcastEnvelope::cleared(&owner, ty, self.channel.tab_id(), now);
        if let Err(e) = self.channel.publish(&envelope) {
            warn!("Broadcast of {} clear failed: {}", ty, e);
        }

        if let Some(remote_id) = remote_id.filter(|_| !owner.is_anonymous()) {
            self.commands.push_back(RemoteCommand::Delete {
                owner: owner.clone(),
                doc_type: ty,
                remote_id,
            });
        }
        info!("Cleared {} for {}", ty, owner);
        Ok(())
    }

    /// Re-fetches both documents from the remote with login rules.
    pub fn refresh(&mut self) -> Result<()> {
        let owner = self.require_owner()?;
        if owner.is_anonymous() {
            return Ok(());
        }
        for ty in DocumentType::ALL {
            self.issue_load(&owner, ty, LoadPurpose::Refresh, None);
        }
        Ok(())
    }

    fn drain_inbox(&mut self) {
        let messages: Vec<Incoming> = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for message in messages {
            match message {
                Incoming::Envelope(envelope) => self.receive_envelope(envelope),
                Incoming::StorageSignal { key } => self.receive_signal(&key),
            }
        }
    }

    fn receive_envelope(&mut self, envelope: BroadcastEnvelope) {
        let Some(owner) = self.owner.clone() else {
            return;
        };
        if envelope.payload.owner_id != owner {
            debug!("Dropping envelope for foreign owner {}", envelope.payload.owner_id);
            return;
        }
        let last_seen = self.origins.entry(envelope.origin_id.clone()).or_insert(0);
        if envelope.timestamp < *last_seen {
            debug!("Dropping out-of-order envelope from {}", envelope.origin_id);
            return;
        }
        *last_seen = envelope.timestamp;

        let ty = envelope.doc_type();
        if envelope.kind.is_clear() {
            self.apply_peer_clear(ty);
            return;
        }
        let candidate = match envelope.content(self.now()) {
            Ok(content) => content,
            Err(e) => {
                warn!("Dropping undecodable {} envelope: {}", ty, e);
                return;
            }
        };
        let slot = self.docs.get_mut(ty);
        if slot.remote_id.is_none() {
            slot.remote_id = envelope.payload.remote_id.clone();
        }
        self.apply_peer(&envelope.payload.owner_id, candidate);
    }

    fn receive_signal(&mut self, key: &str) {
        let Some(owner) = self.owner.clone() else {
            return;
        };
        let Some(key) = StorageKey::parse(key, self.store.prefix()) else {
            trace!("Ignoring unrelated storage key {}", key);
            return;
        };
        if key.owner != owner {
            debug!("Dropping storage signal for foreign owner {}", key.owner);
            return;
        }
        let now = self.now();
        let slot = self.docs.get_mut(key.doc_type);
        if slot
            .last_signal_ms
            .is_some_and(|at| now.saturating_sub(at) < self.config.signal_dedupe_ms)
        {
            slot.signal_deferred = true;
            return;
        }
        slot.last_signal_ms = Some(now);
        self.reread_store(&owner, key.doc_type);
    }

    fn reread_store(&mut self, owner: &OwnerId, ty: DocumentType) {
        if !self.store.has_primary(owner, ty) {
            if !self.docs.get(ty).content.is_empty() {
                self.apply_peer_clear(ty);
            }
            return;
        }
        let candidate = self.store.read(owner, ty, self.now());
        self.apply_peer(owner, candidate);
    }

    fn apply_peer(&mut self, candidate_owner: &OwnerId, candidate: DocumentContent) {
        let now = self.now();
        let ty = candidate.doc_type();
        let slot = self.docs.get_mut(ty);
        match reconcile::decide_peer(self.owner.as_ref(), candidate_owner, &slot.content, &candidate) {
            PeerDecision::Apply => {
                if let Some(fp) = fingerprint(&candidate, now) {
                    slot.scheduler.settle(fp);
                }
                slot.content = candidate;
                debug!("Applied {} from another tab", ty);
            }
            PeerDecision::Reject(reason) => trace!("Ignoring {} from another tab ({:?})", ty, reason),
        }
    }

    /// Another tab cleared `ty`; the shared store is already empty.
    fn apply_peer_clear(&mut self, ty: DocumentType) {
        let now = self.now();
        let slot = self.docs.get_mut(ty);
        let remote_id = slot.remote_id.take();
        let ended = slot.scheduler.next_epoch();
        slot.cleared = Some((ended, remote_id));
        slot.content = DocumentContent::empty(ty);
        slot.load = None;
        slot.load_owed = None;
        slot.save_after_load = false;
        slot.update_syncing();
        if let Some(fp) = fingerprint(&slot.content, now) {
            slot.scheduler.settle(fp);
        }
        info!("{} cleared by another tab", ty);
    }

    pub fn content(&self, ty: DocumentType) -> &DocumentContent {
        &self.docs.get(ty).content
    }

    pub fn content_for(&self, owner: &OwnerId, ty: DocumentType) -> Result<&DocumentContent> {
        reconcile::check_owner(self.owner.as_ref(), owner)?;
        Ok(self.content(ty))
    }

    pub fn status(&self, ty: DocumentType) -> DocStatus {
        let slot = self.docs.get(ty);
        let countdown_ms = if slot.scheduler.is_dirty() {
            slot.scheduler.persist.remaining(self.now())
        } else {
            None
        };
        DocStatus {
            state: slot.scheduler.state(),
            save: slot.save.clone(),
            sync: slot.sync.clone(),
            countdown_ms,
            remote_id: slot.remote_id.clone(),
        }
    }

    /// Drains the queued remote work.
    pub fn take_commands(&mut self) -> Vec<RemoteCommand> {
        self.commands.drain(..).collect()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }
}
