//! Cross-tab broadcast bus.
//!
//! Tabs of one browser profile notify each other about document changes.
//! Delivery is best effort and only ordered per sender; receivers treat every
//! message as a hint and re-check it against their own state.
//!
//! Two channel flavours implement `TabChannel`:
//! - `NativeChannel` carries full envelopes (content included), like a
//!   `BroadcastChannel`.
//! - `StorageSignalChannel` only announces which storage key changed, like
//!   the `storage` event; receivers re-read the durable store.
//!
//! `BroadcastHub` is the in-process medium both flavours publish through.
//! The browser build supplies its own channel backed by JS instead.

use crate::document::{DocumentContent, DocumentType};
use crate::keys::{KeyRole, StorageKey};
use crate::owner::OwnerId;
use crate::remote::RemoteId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Envelope content error: {0}")]
    Content(#[from] crate::document::DocumentError),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, BroadcastError>;

/// Identifier of one tab (one running session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    pub fn generate() -> Self {
        Self(format!("tab_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TabId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    TodoUpdated,
    NotesUpdated,
    TodoCleared,
    NotesCleared,
}

impl EnvelopeKind {
    pub fn updated(ty: DocumentType) -> Self {
        match ty {
            DocumentType::TaskList => EnvelopeKind::TodoUpdated,
            DocumentType::Note => EnvelopeKind::NotesUpdated,
        }
    }

    pub fn cleared(ty: DocumentType) -> Self {
        match ty {
            DocumentType::TaskList => EnvelopeKind::TodoCleared,
            DocumentType::Note => EnvelopeKind::NotesCleared,
        }
    }

    pub fn doc_type(&self) -> DocumentType {
        match self {
            EnvelopeKind::TodoUpdated | EnvelopeKind::TodoCleared => DocumentType::TaskList,
            EnvelopeKind::NotesUpdated | EnvelopeKind::NotesCleared => DocumentType::Note,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, EnvelopeKind::TodoCleared | EnvelopeKind::NotesCleared)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopePayload {
    #[serde(alias = "userId")]
    pub owner_id: OwnerId,
    #[serde(default)]
    pub content: Value,
    /// Lets receivers that have not loaded yet reuse the sender's remote record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
}

/// A cross-tab message.
///
/// Wire format: `{"type":"TODO_UPDATED","payload":{"ownerId":"42","content":[..]},"timestamp":..,"originId":"tab_.."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub payload: EnvelopePayload,
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub origin_id: TabId,
}

impl BroadcastEnvelope {
    pub fn updated(owner: &OwnerId, content: &DocumentContent, origin: &TabId, now_ms: u64) -> Result<Self> {
        Ok(Self {
            kind: EnvelopeKind::updated(content.doc_type()),
            payload: EnvelopePayload {
                owner_id: owner.clone(),
                content: content.to_value()?,
                remote_id: None,
            },
            timestamp: now_ms,
            origin_id: origin.clone(),
        })
    }

    pub fn cleared(owner: &OwnerId, ty: DocumentType, origin: &TabId, now_ms: u64) -> Self {
        Self {
            kind: EnvelopeKind::cleared(ty),
            payload: EnvelopePayload {
                owner_id: owner.clone(),
                content: Value::Null,
                remote_id: None,
            },
            timestamp: now_ms,
            origin_id: origin.clone(),
        }
    }

    pub fn with_remote_id(mut self, remote_id: Option<RemoteId>) -> Self {
        self.payload.remote_id = remote_id;
        self
    }

    pub fn doc_type(&self) -> DocumentType {
        self.kind.doc_type()
    }

    /// Decoded content carried by an update envelope.
    pub fn content(&self, now_ms: u64) -> Result<DocumentContent> {
        if self.kind.is_clear() {
            return Ok(DocumentContent::empty(self.doc_type()));
        }
        Ok(DocumentContent::from_value(
            self.doc_type(),
            self.payload.content.clone(),
            now_ms,
        )?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Envelope(BroadcastEnvelope),
    /// A storage key was written or removed by another tab.
    StorageSignal { key: String },
}

pub type Handler = Arc<dyn Fn(Incoming) + Send + Sync>;

#[cfg(not(target_arch = "wasm32"))]
pub type Cancel = Box<dyn FnOnce() + Send + Sync>;
#[cfg(target_arch = "wasm32")]
pub type Cancel = Box<dyn FnOnce()>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving messages, drop it to unsubscribe.
pub struct Subscription {
    cancel: Option<Cancel>,
}

impl Subscription {
    pub fn new(cancel: Cancel) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Native,
    StorageSignal,
}

/// Host capabilities relevant to channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub native_channel: bool,
}

/// Publish/subscribe endpoint of one tab.
///
/// On native platforms, implementations must be `Send + Sync`.
/// On WASM (wasm32), these bounds are relaxed since WASM is single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait TabChannel: Send + Sync {
    fn mode(&self) -> ChannelMode;

    fn tab_id(&self) -> &TabId;

    fn publish(&self, envelope: &BroadcastEnvelope) -> Result<()>;

    /// Messages published by this tab are never delivered back to it.
    fn subscribe(&self, handler: Handler) -> Subscription;
}

/// Publish/subscribe endpoint of one tab (WASM version without Send + Sync).
#[cfg(target_arch = "wasm32")]
pub trait TabChannel {
    fn mode(&self) -> ChannelMode;

    fn tab_id(&self) -> &TabId;

    fn publish(&self, envelope: &BroadcastEnvelope) -> Result<()>;

    /// Messages published by this tab are never delivered back to it.
    fn subscribe(&self, handler: Handler) -> Subscription;
}

/// In-process dispatcher shared by all tabs of one simulated profile.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct BroadcastHub {
    subscribers: RwLock<Vec<(usize, TabId, Handler)>>,
    next_id: AtomicUsize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(self: &Arc<Self>, tab: TabId, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tab, handler));
        let hub: Weak<Self> = Arc::downgrade(self);
        Subscription::new(Box::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.unsubscribe(id);
            }
        }))
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while a dispatch holds the read lock.
        if let Ok(mut guard) = self.subscribers.try_write() {
            guard.retain(|(i, _, _)| *i != id);
        }
    }

    /// Delivers `message` to every subscriber not belonging to `from`.
    pub fn dispatch(&self, from: &TabId, message: Incoming) {
        // Clone the handler list so a handler may subscribe without deadlocking.
        let handlers: Vec<_> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, tab, _)| tab != from)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();

        trace!("Dispatching from {} to {} subscribers", from, handlers.len());
        for handler in handlers {
            handler(message.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Full-envelope channel.
pub struct NativeChannel {
    hub: Arc<BroadcastHub>,
    tab: TabId,
}

impl NativeChannel {
    pub fn new(hub: Arc<BroadcastHub>, tab: TabId) -> Self {
        Self { hub, tab }
    }
}

impl TabChannel for NativeChannel {
    fn mode(&self) -> ChannelMode {
        ChannelMode::Native
    }

    fn tab_id(&self) -> &TabId {
        &self.tab
    }

    fn publish(&self, envelope: &BroadcastEnvelope) -> Result<()> {
        self.hub.dispatch(&self.tab, Incoming::Envelope(envelope.clone()));
        Ok(())
    }

    fn subscribe(&self, handler: Handler) -> Subscription {
        self.hub.subscribe(self.tab.clone(), handler)
    }
}

/// Fallback channel: announces the primary storage key of the document an
/// envelope is about, never the content.
pub struct StorageSignalChannel {
    hub: Arc<BroadcastHub>,
    tab: TabId,
    prefix: String,
}

impl StorageSignalChannel {
    pub fn new(hub: Arc<BroadcastHub>, tab: TabId, prefix: impl Into<String>) -> Self {
        Self {
            hub,
            tab,
            prefix: prefix.into(),
        }
    }
}

impl TabChannel for StorageSignalChannel {
    fn mode(&self) -> ChannelMode {
        ChannelMode::StorageSignal
    }

    fn tab_id(&self) -> &TabId {
        &self.tab
    }

    fn publish(&self, envelope: &BroadcastEnvelope) -> Result<()> {
        let key = StorageKey::new(&envelope.payload.owner_id, envelope.doc_type(), KeyRole::Primary)
            .render(&self.prefix);
        self.hub.dispatch(&self.tab, Incoming::StorageSignal { key });
        Ok(())
    }

    fn subscribe(&self, handler: Handler) -> Subscription {
        self.hub.subscribe(self.tab.clone(), handler)
    }
}

/// Picks the richest channel the host supports.
pub fn open_channel(
    hub: &Arc<BroadcastHub>,
    capabilities: Capabilities,
    tab: TabId,
    prefix: &str,
) -> Box<dyn TabChannel> {
    if capabilities.native_channel {
        Box::new(NativeChannel::new(Arc::clone(hub), tab))
    } else {
        Box::new(StorageSignalChannel::new(Arc::clone(hub), tab, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{NoteContent, Task};
    use std::sync::Mutex;

    const NOW: u64 = 1_750_000_000_000;

    fn owner() -> OwnerId {
        OwnerId::new("42").unwrap()
    }

    fn collector() -> (Arc<Mutex<Vec<Incoming>>>, Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |m| sink.lock().unwrap().push(m)))
    }

    #[test]
    fn test_envelope_wire_format() {
        let tab = TabId::new("tab_a");
        let content = DocumentContent::Note(NoteContent::new("hi", ""));
        let env = BroadcastEnvelope::updated(&owner(), &content, &tab, NOW).unwrap();
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "NOTES_UPDATED",
                "payload": {"ownerId": "42", "content": {"notes": "hi", "transcription": ""}},
                "timestamp": NOW,
                "originId": "tab_a"
            })
        );
        assert_eq!(BroadcastEnvelope::from_json(&env.to_json().unwrap()).unwrap(), env);
        assert_eq!(env.content(NOW).unwrap(), content);
    }

    #[test]
    fn test_envelope_accepts_user_id_payload() {
        let raw = r#"{"type":"TODO_UPDATED","payload":{"userId":42,"content":[]},"timestamp":1,"originId":"tab_b"}"#;
        let env = BroadcastEnvelope::from_json(raw).unwrap();
        assert_eq!(env.payload.owner_id, owner());
        assert_eq!(env.doc_type(), DocumentType::TaskList);
    }

    #[test]
    fn test_cleared_envelope_content_is_empty() {
        let env = BroadcastEnvelope::cleared(&owner(), DocumentType::TaskList, &TabId::new("t"), NOW);
        assert!(env.kind.is_clear());
        assert!(env.content(NOW).unwrap().is_empty());
    }

    #[test]
    fn test_native_channel_skips_sender() {
        let hub = Arc::new(BroadcastHub::new());
        let a = NativeChannel::new(Arc::clone(&hub), TabId::new("a"));
        let b = NativeChannel::new(Arc::clone(&hub), TabId::new("b"));
        let (seen_a, handler_a) = collector();
        let (seen_b, handler_b) = collector();
        let _sa = a.subscribe(handler_a);
        let _sb = b.subscribe(handler_b);

        let content = DocumentContent::Tasks(vec![Task::new("x", NOW)]);
        let env = BroadcastEnvelope::updated(&owner(), &content, a.tab_id(), NOW).unwrap();
        a.publish(&env).unwrap();

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(*seen_b.lock().unwrap(), vec![Incoming::Envelope(env)]);
    }

    #[test]
    fn test_storage_signal_channel_sends_key_only() {
        let hub = Arc::new(BroadcastHub::new());
        let caps = Capabilities { native_channel: false };
        let a = open_channel(&hub, caps, TabId::new("a"), "");
        let b = open_channel(&hub, caps, TabId::new("b"), "");
        assert_eq!(a.mode(), ChannelMode::StorageSignal);
        let (seen, handler) = collector();
        let _sub = b.subscribe(handler);

        let env = BroadcastEnvelope::cleared(&owner(), DocumentType::Note, a.tab_id(), NOW);
        a.publish(&env).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Incoming::StorageSignal {
                key: "layout_notes_42".into()
            }]
        );
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let hub = Arc::new(BroadcastHub::new());
        let (seen, handler) = collector();
        {
            let _sub = hub.subscribe(TabId::new("b"), handler);
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
        hub.dispatch(&TabId::new("a"), Incoming::StorageSignal { key: "k".into() });
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_tab_ids_are_unique() {
        let a = TabId::generate();
        let b = TabId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tab_"));
    }
}
