//! JavaScript host bridges for WASM.
//!
//! Each bridge implements one docsync-core seam by calling JavaScript
//! callbacks supplied by the page:
//! - `JsStorageBridge` - `KvBackend` over synchronous `localStorage`-style calls
//! - `JsChannelBridge` - `TabChannel` over a `BroadcastChannel`, or over the
//!   `storage` event when the page has none
//! - `JsHttpBridge` - `HttpPost` over an async `fetch` wrapper

use async_trait::async_trait;
use docsync_core::broadcast::{self, Cancel, Handler};
use docsync_core::remote::RemoteError;
use docsync_core::store::{self, KvBackend, StoreError};
use docsync_core::{BroadcastEnvelope, ChannelMode, HttpPost, HttpResponse, Incoming, Subscription, TabChannel, TabId};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

/// Extracts a readable message from a thrown JS value.
fn js_message(err: &JsValue) -> String {
    err.as_string()
        .or_else(|| {
            js_sys::Reflect::get(err, &"message".into())
                .ok()
                .and_then(|v| v.as_string())
        })
        .unwrap_or_else(|| format!("{:?}", err))
}

fn js_error_name(err: &JsValue) -> Option<String> {
    js_sys::Reflect::get(err, &"name".into())
        .ok()
        .and_then(|v| v.as_string())
}

// ============================================================================
// Storage
// ============================================================================

/// Durable key/value storage.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const storage = new JsStorageBridge(
///   (key) => localStorage.getItem(key),
///   (key, value) => localStorage.setItem(key, value),
///   (key) => localStorage.removeItem(key),
/// );
/// ```
#[wasm_bindgen]
pub struct JsStorageBridge {
    get_fn: js_sys::Function,
    set_fn: js_sys::Function,
    remove_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsStorageBridge {
    /// All callbacks are synchronous.
    #[wasm_bindgen(constructor)]
    pub fn new(get_fn: js_sys::Function, set_fn: js_sys::Function, remove_fn: js_sys::Function) -> Self {
        Self {
            get_fn,
            set_fn,
            remove_fn,
        }
    }
}

impl KvBackend for JsStorageBridge {
    fn get(&self, key: &str) -> store::Result<Option<String>> {
        let value = self
            .get_fn
            .call1(&JsValue::NULL, &key.into())
            .map_err(|e| StoreError::Backend(js_message(&e)))?;
        Ok(value.as_string())
    }

    fn set(&self, key: &str, value: &str) -> store::Result<()> {
        self.set_fn
            .call2(&JsValue::NULL, &key.into(), &value.into())
            .map_err(|e| {
                if js_error_name(&e).as_deref() == Some("QuotaExceededError") {
                    StoreError::QuotaExceeded(key.to_string())
                } else {
                    StoreError::Backend(js_message(&e))
                }
            })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> store::Result<()> {
        self.remove_fn
            .call1(&JsValue::NULL, &key.into())
            .map_err(|e| StoreError::Backend(js_message(&e)))?;
        Ok(())
    }
}

// ============================================================================
// Tab channel
// ============================================================================

type Handlers = Rc<RefCell<Vec<(usize, Handler)>>>;

/// Receiving end of a `JsChannelBridge`, kept by the session so the page can
/// hand over messages after the bridge itself has moved into the engine.
#[derive(Clone, Default)]
pub(crate) struct ChannelInbox {
    handlers: Handlers,
}

impl ChannelInbox {
    pub(crate) fn deliver(&self, message: Incoming) {
        // Clone out first: a handler may subscribe or unsubscribe.
        let handlers: Vec<Handler> = self.handlers.borrow().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(message.clone());
        }
    }
}

/// Tab-to-tab channel.
///
/// With a `post` callback the bridge runs in native mode and posts envelope
/// JSON, the way a `BroadcastChannel` does. Without one it runs in
/// storage-signal mode: the durable write is the announcement, and the page
/// forwards `storage` events instead.
pub struct JsChannelBridge {
    tab: TabId,
    post_fn: Option<js_sys::Function>,
    inbox: ChannelInbox,
    next_id: Cell<usize>,
}

impl JsChannelBridge {
    pub(crate) fn new(tab: TabId, post_fn: Option<js_sys::Function>, inbox: ChannelInbox) -> Self {
        Self {
            tab,
            post_fn,
            inbox,
            next_id: Cell::new(0),
        }
    }
}

impl TabChannel for JsChannelBridge {
    fn mode(&self) -> ChannelMode {
        if self.post_fn.is_some() {
            ChannelMode::Native
        } else {
            ChannelMode::StorageSignal
        }
    }

    fn tab_id(&self) -> &TabId {
        &self.tab
    }

    fn publish(&self, envelope: &BroadcastEnvelope) -> broadcast::Result<()> {
        let Some(post_fn) = &self.post_fn else {
            return Ok(());
        };
        let json = envelope.to_json()?;
        post_fn
            .call1(&JsValue::NULL, &json.into())
            .map_err(|e| broadcast::BroadcastError::Unavailable(js_message(&e)))?;
        Ok(())
    }

    fn subscribe(&self, handler: Handler) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.inbox.handlers.borrow_mut().push((id, handler));
        let handlers: Weak<RefCell<Vec<(usize, Handler)>>> = Rc::downgrade(&self.inbox.handlers);
        let cancel: Cancel = Box::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                handlers.borrow_mut().retain(|(other, _)| *other != id);
            }
        });
        Subscription::new(cancel)
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(serde::Deserialize)]
struct JsHttpResponse {
    status: u16,
    #[serde(default)]
    body: String,
}

/// HTTP transport for the document API.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const http = new JsHttpBridge(async (endpoint, body) => {
///   const res = await fetch(`${API}/${endpoint}`, { method: "POST", body });
///   return { status: res.status, body: await res.text() };
/// });
/// ```
#[wasm_bindgen]
pub struct JsHttpBridge {
    post_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsHttpBridge {
    /// The callback must return a Promise of `{ status, body }` and reject
    /// only on transport failure.
    #[wasm_bindgen(constructor)]
    pub fn new(post_fn: js_sys::Function) -> Self {
        Self { post_fn }
    }
}

#[async_trait(?Send)]
impl HttpPost for JsHttpBridge {
    async fn post(&self, endpoint: &str, body: String) -> Result<HttpResponse, RemoteError> {
        let promise = self
            .post_fn
            .call2(&JsValue::NULL, &endpoint.into(), &body.into())
            .map_err(|e| RemoteError::Network(js_message(&e)))?;
        let result = JsFuture::from(js_sys::Promise::from(promise))
            .await
            .map_err(|e| RemoteError::Network(js_message(&e)))?;
        let response: JsHttpResponse = serde_wasm_bindgen::from_value(result)
            .map_err(|e| RemoteError::Network(format!("Failed to parse HTTP response: {}", e)))?;
        Ok(HttpResponse {
            status: response.status,
            body: response.body,
        })
    }
}
