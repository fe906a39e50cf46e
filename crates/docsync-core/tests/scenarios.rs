//! End-to-end tests for docsync-core.
//!
//! Several tabs share one durable store, one broadcast hub and one remote,
//! the way tabs of a browser profile do. Time is driven by a manual clock.

use std::sync::Arc;
use std::time::Duration;

use docsync_core::{
    open_channel, BroadcastHub, Capabilities, DocumentContent, DocumentType, FlushState, InMemoryKv,
    InMemoryRemote, KvBackend, LifecycleEvent, LocalStore, ManualClock, NoteContent, OwnerId, Priority,
    SyncConfig, SyncDriver, SyncSession, TabId, Task, TaskEdit,
};

const NOW: u64 = 1_750_000_000_000;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

type Tab = SyncDriver<Arc<InMemoryKv>, Arc<InMemoryRemote>>;

/// One simulated browser profile.
struct World {
    clock: Arc<ManualClock>,
    kv: Arc<InMemoryKv>,
    hub: Arc<BroadcastHub>,
    remote: Arc<InMemoryRemote>,
}

impl World {
    fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new(NOW)),
            kv: Arc::new(InMemoryKv::new()),
            hub: Arc::new(BroadcastHub::new()),
            remote: Arc::new(InMemoryRemote::new()),
        }
    }

    fn open_tab(&self, name: &str, native_channel: bool) -> Tab {
        let channel = open_channel(&self.hub, Capabilities { native_channel }, TabId::new(name), "");
        let session = SyncSession::new(
            SyncConfig::default(),
            self.clock.clone(),
            Arc::clone(&self.kv),
            channel,
        );
        SyncDriver::new(session, Arc::clone(&self.remote))
    }

    fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

fn owner(id: &str) -> OwnerId {
    OwnerId::new(id).unwrap()
}

fn note(text: &str) -> DocumentContent {
    DocumentContent::Note(NoteContent::new(text, ""))
}

fn notes_of(tab: &Tab) -> String {
    tab.session()
        .content(DocumentType::Note)
        .as_note()
        .map(|n| n.notes.clone())
        .unwrap_or_default()
}

fn tasks_of(tab: &Tab) -> Vec<Task> {
    tab.session()
        .content(DocumentType::TaskList)
        .as_tasks()
        .map(|t| t.to_vec())
        .unwrap_or_default()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_note_survives_tab_switch() {
    let world = World::new();
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(owner("42")).await;

    tab.session_mut().set_note("Buy milk").unwrap();
    world.advance(Duration::from_secs(2));
    tab.lifecycle(LifecycleEvent::Hidden).await;
    assert_eq!(world.remote.save_count(), 1);

    // back to the tab; the idle timer was cancelled by the flush
    world.advance(Duration::from_secs(15));
    tab.tick().await;

    assert_eq!(notes_of(&tab), "Buy milk");
    assert_eq!(world.remote.save_count(), 1);
    assert_eq!(
        world.remote.get(&owner("42"), DocumentType::Note).unwrap().content,
        note("Buy milk")
    );
    assert_eq!(tab.session().status(DocumentType::Note).state, FlushState::Idle);
}

#[tokio::test]
async fn test_task_reaches_other_tab_once() {
    let world = World::new();
    let mut a = world.open_tab("tab_a", true);
    let mut b = world.open_tab("tab_b", true);
    a.set_owner(owner("42")).await;
    b.set_owner(owner("42")).await;

    a.session_mut()
        .edit_tasks(TaskEdit::Add("Call supplier".into()))
        .unwrap();
    a.tick().await;
    world.advance(Duration::from_secs(4));
    b.tick().await;
    a.tick().await;
    b.tick().await;

    let tasks = tasks_of(&b);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].text, "Call supplier");
    assert!(!tasks[0].done);
    assert_eq!(tasks[0].priority, Priority::Normal);
    assert_eq!(tasks_of(&a), tasks);

    // only the editing tab talks to the remote
    assert_eq!(world.remote.save_count(), 1);
}

#[tokio::test]
async fn test_remote_failure_keeps_local_and_retries() {
    let world = World::new();
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(owner("42")).await;

    world.remote.set_offline(true);
    tab.session_mut().set_note("offline draft").unwrap();
    tab.request_flush(DocumentType::Note).await.unwrap();

    let status = tab.session().status(DocumentType::Note);
    assert!(!status.sync.syncing);
    assert_eq!(status.sync.last_error.as_ref().map(|e| e.kind()), Some("NetworkFailure"));
    assert_eq!(status.state, FlushState::Dirty);
    assert!(status.save.last_error.is_none());
    assert_eq!(notes_of(&tab), "offline draft");
    assert_eq!(
        tab.session().store().read(&owner("42"), DocumentType::Note, NOW),
        note("offline draft")
    );

    world.remote.set_offline(false);
    tab.request_flush(DocumentType::Note).await.unwrap();

    let status = tab.session().status(DocumentType::Note);
    assert!(status.sync.last_error.is_none());
    assert_eq!(status.state, FlushState::Idle);
    assert!(status.remote_id.is_some());
    assert_eq!(
        world.remote.get(&owner("42"), DocumentType::Note).unwrap().content,
        note("offline draft")
    );
}

#[tokio::test]
async fn test_retry_timer_resends_after_outage() {
    let world = World::new();
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(owner("42")).await;

    world.remote.set_offline(true);
    tab.session_mut()
        .edit_tasks(TaskEdit::Add("persist me".into()))
        .unwrap();
    tab.tick().await;
    assert_eq!(tab.session().status(DocumentType::TaskList).state, FlushState::Dirty);

    world.remote.set_offline(false);
    world.advance(Duration::from_secs(15));
    tab.tick().await;
    assert_eq!(tab.session().status(DocumentType::TaskList).state, FlushState::Idle);
    assert!(world.remote.get(&owner("42"), DocumentType::TaskList).is_some());
}

#[tokio::test]
async fn test_login_replaces_local_with_remote() {
    let world = World::new();
    let a = owner("7");
    world.remote.insert(&a, note("final A"));
    LocalStore::new(Arc::clone(&world.kv), "")
        .write(&a, &note("draft A"), NOW)
        .unwrap();

    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(a.clone()).await;

    assert_eq!(notes_of(&tab), "final A");
    assert_eq!(tab.session().store().read(&a, DocumentType::Note, NOW), note("final A"));
    assert_eq!(world.remote.save_count(), 0);
}

#[tokio::test]
async fn test_login_load_beats_edit_made_while_loading() {
    let world = World::new();
    let a = owner("7");
    world.remote.insert(&a, note("final A"));
    LocalStore::new(Arc::clone(&world.kv), "")
        .write(&a, &note("draft A"), NOW)
        .unwrap();

    let mut tab = world.open_tab("tab_a", true);
    tab.session_mut().set_owner(a.clone());
    tab.session_mut().set_note("draft A!").unwrap();
    tab.run().await;

    assert_eq!(notes_of(&tab), "final A");
    assert_eq!(world.remote.get(&a, DocumentType::Note).unwrap().content, note("final A"));

    world.advance(Duration::from_secs(15));
    tab.tick().await;
    assert_eq!(world.remote.save_count(), 0);
    assert_eq!(tab.session().store().read(&a, DocumentType::Note, NOW), note("final A"));
}

#[tokio::test]
async fn test_legacy_string_note_is_upgraded() {
    let world = World::new();
    world.kv.set("layout_notes_42", "old note").unwrap();

    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(owner("42")).await;

    assert_eq!(
        tab.session().content(DocumentType::Note),
        &DocumentContent::Note(NoteContent::new("old note", ""))
    );
    let stored: serde_json::Value =
        serde_json::from_str(&world.kv.get("layout_notes_42").unwrap().unwrap()).unwrap();
    assert_eq!(stored, serde_json::json!({"notes": "old note", "transcription": ""}));
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_round_trip_through_reload() {
    let world = World::new();
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(owner("42")).await;
    tab.session_mut().edit_tasks(TaskEdit::Add("first".into())).unwrap();
    tab.session_mut().edit_tasks(TaskEdit::Add("second".into())).unwrap();
    tab.session_mut().set_transcription("spoken words").unwrap();
    tab.lifecycle(LifecycleEvent::Unloading).await;
    let before_tasks = tasks_of(&tab);
    drop(tab);

    let mut reloaded = world.open_tab("tab_b", true);
    reloaded.set_owner(owner("42")).await;
    assert_eq!(tasks_of(&reloaded), before_tasks);
    assert_eq!(
        reloaded.session().content(DocumentType::Note).as_note().unwrap().transcription,
        "spoken words"
    );
}

#[tokio::test]
async fn test_two_flushes_one_save() {
    let world = World::new();
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(owner("42")).await;
    tab.session_mut().set_note("same").unwrap();

    tab.request_flush(DocumentType::Note).await.unwrap();
    tab.request_flush(DocumentType::Note).await.unwrap();
    tab.lifecycle(LifecycleEvent::ManualSave(DocumentType::Note)).await;

    assert_eq!(world.remote.save_count(), 1);
}

#[tokio::test]
async fn test_empty_remote_never_erases_local() {
    let world = World::new();
    let o = owner("42");
    world.remote.insert(&o, DocumentContent::Tasks(Vec::new()));

    let mut seed = world.open_tab("tab_seed", true);
    seed.set_owner(o.clone()).await;
    seed.session_mut().edit_tasks(TaskEdit::Add("keep me".into())).unwrap();
    seed.session_mut().tick();
    drop(seed);

    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(o.clone()).await;
    assert_eq!(tasks_of(&tab).len(), 1);
    // the local list was owed and uploaded
    let uploaded = world.remote.get(&o, DocumentType::TaskList).unwrap();
    assert_eq!(uploaded.content.as_tasks().unwrap().len(), 1);
}

#[tokio::test]
async fn test_owners_are_isolated() {
    let world = World::new();
    let mut a = world.open_tab("tab_a", true);
    let mut b = world.open_tab("tab_b", true);
    a.set_owner(owner("1")).await;
    b.set_owner(owner("2")).await;

    a.session_mut().set_note("private to 1").unwrap();
    a.request_flush(DocumentType::Note).await.unwrap();
    b.tick().await;
    assert_eq!(notes_of(&b), "");

    a.clear_owner().await;
    assert!(a.session_mut().set_note("nobody").is_err());
    a.set_owner(owner("2")).await;
    assert_eq!(notes_of(&a), "");

    a.set_owner(owner("1")).await;
    assert_eq!(notes_of(&a), "private to 1");
}

#[tokio::test]
async fn test_owner_ids_cannot_alias_backup_keys() {
    assert!("backup_7".parse::<OwnerId>().is_err());

    let world = World::new();
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(owner("backup-7")).await;
    tab.session_mut()
        .edit_tasks(TaskEdit::Add("secret of backup-7".into()))
        .unwrap();
    tab.request_flush(DocumentType::TaskList).await.unwrap();
    tab.clear_owner().await;

    tab.set_owner(owner("7")).await;
    assert!(tasks_of(&tab).is_empty());
    assert!(tab
        .session()
        .store()
        .read_backup(&owner("7"), DocumentType::TaskList, NOW)
        .is_none_or(|backup| backup.is_empty()));
}

#[tokio::test]
async fn test_local_write_failure_still_reaches_remote() {
    let world = World::new();
    let o = owner("42");
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(o.clone()).await;
    world.kv.set_quota(Some(40));

    let text = "far too long to fit in forty bytes of local storage";
    tab.session_mut().set_note(text).unwrap();
    tab.request_flush(DocumentType::Note).await.unwrap();

    let status = tab.session().status(DocumentType::Note);
    assert_eq!(status.save.last_error.as_ref().map(|e| e.kind()), Some("SerializationFailure"));
    assert_eq!(status.save.last_saved_at, None);
    assert_eq!(status.sync.last_error, None);
    assert_eq!(notes_of(&tab), text);
    assert_eq!(world.remote.save_count(), 1);
    assert_eq!(world.remote.get(&o, DocumentType::Note).unwrap().content, note(text));
    assert!(!tab.session().store().has_primary(&o, DocumentType::Note));
}

#[tokio::test]
async fn test_stale_local_is_refetched() {
    let world = World::new();
    let o = owner("42");
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(o.clone()).await;
    tab.session_mut().set_note("from this device").unwrap();
    tab.request_flush(DocumentType::Note).await.unwrap();

    // another device saved meanwhile
    world.remote.insert(&o, note("from elsewhere"));
    world.advance(DAY * 6);
    tab.tick().await;
    assert_eq!(notes_of(&tab), "from this device");

    world.advance(DAY * 2);
    tab.tick().await;
    assert_eq!(notes_of(&tab), "from elsewhere");
}

#[tokio::test]
async fn test_anonymous_notes_carry_into_login() {
    let world = World::new();
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(OwnerId::anonymous()).await;
    tab.session_mut().set_note("before login").unwrap();
    tab.lifecycle(LifecycleEvent::PanelClosed(DocumentType::Note)).await;
    assert_eq!(world.remote.save_count(), 0);

    tab.set_owner(owner("42")).await;
    assert_eq!(notes_of(&tab), "before login");
    assert_eq!(
        world.remote.get(&owner("42"), DocumentType::Note).unwrap().content,
        note("before login")
    );
    // the anonymous copy is left in place
    assert!(tab.session().store().has_primary(&OwnerId::anonymous(), DocumentType::Note));
}

#[tokio::test]
async fn test_storage_signal_fallback() {
    let world = World::new();
    let mut a = world.open_tab("tab_a", false);
    let mut b = world.open_tab("tab_b", false);
    a.set_owner(owner("42")).await;
    b.set_owner(owner("42")).await;

    a.session_mut().edit_tasks(TaskEdit::Add("one".into())).unwrap();
    a.tick().await;
    a.session_mut().edit_tasks(TaskEdit::Add("two".into())).unwrap();
    a.tick().await;

    b.tick().await;
    assert_eq!(tasks_of(&b).len(), 2);
    world.advance(Duration::from_millis(100));
    b.tick().await;
    assert_eq!(tasks_of(&b), tasks_of(&a));

    a.clear(DocumentType::TaskList).await.unwrap();
    world.advance(Duration::from_millis(100));
    b.tick().await;
    assert!(tasks_of(&b).is_empty());
}

#[tokio::test]
async fn test_refresh_pulls_remote_changes() {
    let world = World::new();
    let o = owner("42");
    let mut tab = world.open_tab("tab_a", true);
    tab.set_owner(o.clone()).await;

    world.remote.insert(&o, DocumentContent::Tasks(vec![Task::new("from phone", NOW)]));
    tab.refresh().await.unwrap();
    assert_eq!(tasks_of(&tab)[0].text, "from phone");
}
