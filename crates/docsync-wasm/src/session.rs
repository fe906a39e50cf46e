//! Browser-side session.
//!
//! `WasmSession` keeps the sans-IO `SyncSession` in an `Rc<RefCell>` and runs
//! its remote commands with `spawn_local`. The session is never borrowed
//! across an await, so the page may call in while requests are in flight.
//!
//! The page is expected to:
//! - call `tick()` on an interval (a few times per second is plenty)
//! - forward channel messages to `receiveMessage` and `storage` events to
//!   `receiveStorageSignal`
//! - call `onHidden()` / `onUnload()` from `visibilitychange` / `pagehide`

use crate::bridge::{ChannelInbox, JsChannelBridge, JsHttpBridge, JsStorageBridge};
use docsync_core::{
    ApiRemote, BroadcastEnvelope, ChannelMode, Clock, Credentials, DocumentContent, DocumentType, Incoming,
    LifecycleEvent, OwnerId, Priority, RemoteCommand, RemoteStore, SyncConfig, SyncSession, SystemClock, TabId,
    Task, TaskEdit, TaskId,
};
use serde::Serialize;
use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;
use wasm_bindgen::prelude::*;

fn js_err(e: impl Display) -> JsError {
    JsError::new(&e.to_string())
}

fn to_js<T: Serialize>(value: &T) -> Result<JsValue, JsError> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(js_err)
}

fn parse_type(name: &str) -> Result<DocumentType, JsError> {
    DocumentType::from_wire(name).ok_or_else(|| JsError::new(&format!("Unknown document type {:?}", name)))
}

struct Shared {
    session: RefCell<SyncSession<JsStorageBridge>>,
    remote: ApiRemote<JsHttpBridge>,
    inbox: ChannelInbox,
    clock: Arc<dyn Clock>,
    listener: RefCell<Option<js_sys::Function>>,
    /// Content last reported to the listener, per type.
    reported: RefCell<Vec<DocumentContent>>,
}

impl Shared {
    /// Starts every queued remote command. Completions pump again, so
    /// follow-up saves and retries keep flowing.
    fn pump(self: &Rc<Self>) {
        let commands = self.session.borrow_mut().take_commands();
        for command in commands {
            let shared = Rc::clone(self);
            wasm_bindgen_futures::spawn_local(async move {
                shared.execute(command).await;
                shared.notify();
                shared.pump();
            });
        }
    }

    async fn execute(&self, command: RemoteCommand) {
        match command {
            RemoteCommand::Load(ticket) => {
                let result = self.remote.load(&ticket.owner, ticket.doc_type).await;
                self.session.borrow_mut().complete_load(ticket, result);
            }
            RemoteCommand::Save {
                ticket,
                content,
                existing,
            } => {
                let result = self.remote.save(&ticket.owner, &content, existing.as_ref()).await;
                self.session.borrow_mut().complete_save(ticket, result);
            }
            RemoteCommand::Delete {
                owner,
                doc_type,
                remote_id,
            } => {
                let result = self.remote.delete(&owner, doc_type, &remote_id).await;
                self.session.borrow_mut().complete_delete(&owner, doc_type, result);
            }
        }
    }

    /// Calls the listener for every document whose content changed since it
    /// was last reported.
    fn notify(&self) {
        let Some(listener) = self.listener.borrow().clone() else {
            return;
        };
        let mut changed = Vec::new();
        {
            let session = self.session.borrow();
            let mut reported = self.reported.borrow_mut();
            for (ty, last) in DocumentType::ALL.iter().zip(reported.iter_mut()) {
                let current = session.content(*ty);
                if current != last {
                    *last = current.clone();
                    changed.push(current.clone());
                }
            }
        }
        // The listener may call back into the session, so no borrow is held here.
        for content in changed {
            let Ok(value) = content.to_value() else {
                continue;
            };
            if let Ok(js_value) = to_js(&value) {
                let _ = listener.call2(&JsValue::NULL, &content.doc_type().wire_name().into(), &js_value);
            }
        }
    }
}

/// One tab's sync engine, exposed to TypeScript.
///
/// Document types are named by their API names, `"TODO"` and `"NOTES"`.
#[wasm_bindgen]
pub struct WasmSession {
    shared: Rc<Shared>,
}

impl WasmSession {
    /// Runs `f` against the session, then starts any remote work it queued.
    fn with_session<T>(&self, f: impl FnOnce(&mut SyncSession<JsStorageBridge>) -> T) -> T {
        let result = f(&mut self.shared.session.borrow_mut());
        self.shared.notify();
        self.shared.pump();
        result
    }

    fn edit_tasks(&self, edit: TaskEdit) -> Result<bool, JsError> {
        self.with_session(|s| s.edit_tasks(edit)).map_err(js_err)
    }

    fn lifecycle(&self, event: LifecycleEvent) {
        self.with_session(|s| s.lifecycle(event));
    }

    fn deliver(&self, message: Incoming) {
        self.shared.inbox.deliver(message);
        self.with_session(|s| s.tick());
    }
}

#[wasm_bindgen]
impl WasmSession {
    /// Create a session for this tab.
    ///
    /// Pass `postMessage` (posting to a `BroadcastChannel`) when the browser
    /// has one; pass `undefined` to fall back to storage signals. `config`
    /// is an optional partial `SyncConfig` in camelCase.
    #[wasm_bindgen(constructor)]
    pub fn new(
        storage: JsStorageBridge,
        http: JsHttpBridge,
        post_message: Option<js_sys::Function>,
        config: JsValue,
    ) -> Result<WasmSession, JsError> {
        let config: SyncConfig = if config.is_undefined() || config.is_null() {
            SyncConfig::default()
        } else {
            serde_wasm_bindgen::from_value(config).map_err(js_err)?
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let inbox = ChannelInbox::default();
        let channel = JsChannelBridge::new(TabId::generate(), post_message, inbox.clone());
        let session = SyncSession::new(config, Arc::clone(&clock), storage, Box::new(channel));
        let reported = DocumentType::ALL.iter().map(|ty| DocumentContent::empty(*ty)).collect();

        Ok(WasmSession {
            shared: Rc::new(Shared {
                session: RefCell::new(session),
                remote: ApiRemote::new(http, Arc::clone(&clock)),
                inbox,
                clock,
                listener: RefCell::new(None),
                reported: RefCell::new(reported),
            }),
        })
    }

    #[wasm_bindgen(js_name = tabId)]
    pub fn tab_id(&self) -> String {
        self.shared.session.borrow().tab_id().to_string()
    }

    /// `"native"` or `"storage"`.
    #[wasm_bindgen(js_name = channelMode)]
    pub fn channel_mode(&self) -> String {
        match self.shared.session.borrow().channel_mode() {
            ChannelMode::Native => "native".to_string(),
            ChannelMode::StorageSignal => "storage".to_string(),
        }
    }

    /// Register `(type, content) => void`, called whenever a document's
    /// content changes, including through this tab's own edits.
    #[wasm_bindgen(js_name = onChange)]
    pub fn on_change(&self, callback: Option<js_sys::Function>) {
        *self.shared.listener.borrow_mut() = callback;
    }

    // ========== Owner ==========

    /// Credentials for the document API. Set them before `setOwner` so the
    /// login loads can authenticate.
    #[wasm_bindgen(js_name = setCredentials)]
    pub fn set_credentials(&self, username: String, token: String) {
        self.shared
            .remote
            .set_credentials(Some(Credentials { username, token }));
    }

    #[wasm_bindgen(js_name = clearCredentials)]
    pub fn clear_credentials(&self) {
        self.shared.remote.set_credentials(None);
    }

    /// Switch to `owner`; `"anon"` works locally without the remote.
    #[wasm_bindgen(js_name = setOwner)]
    pub fn set_owner(&self, owner: String) -> Result<(), JsError> {
        let owner = OwnerId::new(owner).map_err(js_err)?;
        self.with_session(|s| s.set_owner(owner));
        Ok(())
    }

    #[wasm_bindgen(js_name = clearOwner)]
    pub fn clear_owner(&self) {
        self.with_session(|s| s.clear_owner());
    }

    // ========== Tasks ==========

    /// Returns whether the list changed.
    #[wasm_bindgen(js_name = addTask)]
    pub fn add_task(&self, text: String) -> Result<bool, JsError> {
        self.edit_tasks(TaskEdit::Add(text))
    }

    #[wasm_bindgen(js_name = toggleTask)]
    pub fn toggle_task(&self, id: String) -> Result<bool, JsError> {
        self.edit_tasks(TaskEdit::Toggle(task_id(&id)))
    }

    #[wasm_bindgen(js_name = removeTask)]
    pub fn remove_task(&self, id: String) -> Result<bool, JsError> {
        self.edit_tasks(TaskEdit::Remove(task_id(&id)))
    }

    #[wasm_bindgen(js_name = moveTask)]
    pub fn move_task(&self, from: usize, to: usize) -> Result<bool, JsError> {
        self.edit_tasks(TaskEdit::Move { from, to })
    }

    /// `priority` is `"low"`, `"normal"` or `"high"`.
    #[wasm_bindgen(js_name = setTaskPriority)]
    pub fn set_task_priority(&self, id: String, priority: String) -> Result<bool, JsError> {
        let priority: Priority = priority.parse().map_err(|e: String| JsError::new(&e))?;
        self.edit_tasks(TaskEdit::SetPriority(task_id(&id), priority))
    }

    /// `alarm` is `{ time, priority, note? }`, a bare timestamp, or null to remove it.
    #[wasm_bindgen(js_name = setTaskAlarm)]
    pub fn set_task_alarm(&self, id: String, alarm: JsValue) -> Result<bool, JsError> {
        let alarm = if alarm.is_undefined() || alarm.is_null() {
            None
        } else {
            Some(serde_wasm_bindgen::from_value(alarm).map_err(js_err)?)
        };
        self.edit_tasks(TaskEdit::SetAlarm(task_id(&id), alarm))
    }

    #[wasm_bindgen(js_name = clearDone)]
    pub fn clear_done(&self) -> Result<bool, JsError> {
        self.edit_tasks(TaskEdit::ClearDone)
    }

    /// Appends tasks from an exported array; old record shapes are upgraded.
    #[wasm_bindgen(js_name = importTasks)]
    pub fn import_tasks(&self, tasks: JsValue) -> Result<bool, JsError> {
        let value: serde_json::Value = serde_wasm_bindgen::from_value(tasks).map_err(js_err)?;
        let imported = match DocumentContent::from_value(DocumentType::TaskList, value, self.shared.clock.now_ms())
            .map_err(js_err)?
        {
            DocumentContent::Tasks(tasks) => tasks,
            DocumentContent::Note(_) => Vec::<Task>::new(),
        };
        self.edit_tasks(TaskEdit::Import(imported))
    }

    // ========== Note ==========

    #[wasm_bindgen(js_name = setNote)]
    pub fn set_note(&self, text: String) -> Result<(), JsError> {
        self.with_session(|s| s.set_note(text)).map_err(js_err)
    }

    #[wasm_bindgen(js_name = setTranscription)]
    pub fn set_transcription(&self, text: String) -> Result<(), JsError> {
        self.with_session(|s| s.set_transcription(text)).map_err(js_err)
    }

    // ========== Flushing ==========

    #[wasm_bindgen(js_name = requestFlush)]
    pub fn request_flush(&self, doc_type: String) -> Result<(), JsError> {
        let ty = parse_type(&doc_type)?;
        self.with_session(|s| s.request_flush(ty)).map_err(js_err)
    }

    #[wasm_bindgen(js_name = onHidden)]
    pub fn on_hidden(&self) {
        self.lifecycle(LifecycleEvent::Hidden);
    }

    #[wasm_bindgen(js_name = onUnload)]
    pub fn on_unload(&self) {
        self.lifecycle(LifecycleEvent::Unloading);
    }

    #[wasm_bindgen(js_name = panelClosed)]
    pub fn panel_closed(&self, doc_type: String) -> Result<(), JsError> {
        self.lifecycle(LifecycleEvent::PanelClosed(parse_type(&doc_type)?));
        Ok(())
    }

    #[wasm_bindgen(js_name = manualSave)]
    pub fn manual_save(&self, doc_type: String) -> Result<(), JsError> {
        self.lifecycle(LifecycleEvent::ManualSave(parse_type(&doc_type)?));
        Ok(())
    }

    /// Empty a document here, in other tabs and on the remote.
    pub fn clear(&self, doc_type: String) -> Result<(), JsError> {
        let ty = parse_type(&doc_type)?;
        self.with_session(|s| s.clear(ty)).map_err(js_err)
    }

    /// Re-fetch both documents from the remote.
    pub fn refresh(&self) -> Result<(), JsError> {
        self.with_session(|s| s.refresh()).map_err(js_err)
    }

    /// Fire due timers and process queued tab messages.
    pub fn tick(&self) {
        self.with_session(|s| s.tick());
    }

    // ========== Tab messages ==========

    /// Envelope JSON received on the tab channel.
    #[wasm_bindgen(js_name = receiveMessage)]
    pub fn receive_message(&self, json: String) -> Result<(), JsError> {
        let envelope = BroadcastEnvelope::from_json(&json).map_err(js_err)?;
        debug!("Received {:?} from {}", envelope.kind, envelope.origin_id);
        self.deliver(Incoming::Envelope(envelope));
        Ok(())
    }

    /// Key of a `storage` event fired by another tab.
    #[wasm_bindgen(js_name = receiveStorageSignal)]
    pub fn receive_storage_signal(&self, key: String) {
        self.deliver(Incoming::StorageSignal { key });
    }

    // ========== Queries ==========

    pub fn content(&self, doc_type: String) -> Result<JsValue, JsError> {
        let ty = parse_type(&doc_type)?;
        let value = self.shared.session.borrow().content(ty).to_value().map_err(js_err)?;
        to_js(&value)
    }

    /// `{ state, save, sync, countdownMs, remoteId }`
    pub fn status(&self, doc_type: String) -> Result<JsValue, JsError> {
        let ty = parse_type(&doc_type)?;
        let status = self.shared.session.borrow().status(ty);
        to_js(&status)
    }
}

fn task_id(id: &str) -> TaskId {
    match id.parse() {
        Ok(id) => id,
        Err(never) => match never {},
    }
}
