//! WASM bindings for docsync-core.
//!
//! Provides the bridge between the browser panels (TypeScript) and the Rust
//! sync engine.
//!
//! # Architecture
//!
//! The page creates one `WasmSession` per tab, handing it bridges to
//! `localStorage`, to the tab channel and to `fetch`. The session owns the
//! engine and runs its remote work on the browser event loop.
//!
//! ```text
//! TypeScript                    WASM (Rust)
//! ──────────                    ───────────
//! localStorage ──callbacks──> JsStorageBridge ──> impl KvBackend
//! BroadcastChannel ─────────> JsChannelBridge ──> impl TabChannel
//! fetch ────────────────────> JsHttpBridge ─────> impl HttpPost ──> ApiRemote
//!                                                        │
//!                                                        ▼
//!                                              SyncSession + spawn_local
//!                                                        │
//!                                                        ▼
//!                                           WasmSession (exposed to JS)
//! ```
//!
//! **Note**: This crate only compiles for `wasm32` targets. When building for native
//! targets (e.g., during `cargo check --workspace`), this crate provides no exports.

#[cfg(target_arch = "wasm32")]
mod bridge;
#[cfg(target_arch = "wasm32")]
mod session;

#[cfg(target_arch = "wasm32")]
pub use bridge::{JsHttpBridge, JsStorageBridge};
#[cfg(target_arch = "wasm32")]
pub use session::WasmSession;

// ============================================================================
// All WASM-specific code is gated behind target_arch = "wasm32"
// This allows `cargo check --workspace` to succeed on native targets.
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use std::cell::RefCell;
    use tracing_subscriber::layer::SubscriberExt;
    use wasm_bindgen::prelude::*;

    // ========== Callback Logger Layer ==========

    /// Store the logger callback in thread-local storage (WASM is single-threaded)
    thread_local! {
        static LOGGER_CALLBACK: RefCell<Option<js_sys::Function>> = const { RefCell::new(None) };
    }

    /// A tracing layer that invokes a JavaScript callback for each log event.
    struct JsCallbackLayer;

    impl<S> tracing_subscriber::Layer<S> for JsCallbackLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            LOGGER_CALLBACK.with(|cb| {
                if let Some(callback) = cb.borrow().as_ref() {
                    let metadata = event.metadata();

                    let mut visitor = MessageVisitor::default();
                    event.record(&mut visitor);

                    let timestamp = web_time::SystemTime::now()
                        .duration_since(web_time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as f64)
                        .unwrap_or(0.0);

                    let js_event = js_sys::Object::new();
                    let _ = js_sys::Reflect::set(&js_event, &"level".into(), &metadata.level().as_str().into());
                    let _ = js_sys::Reflect::set(&js_event, &"target".into(), &metadata.target().into());
                    let _ = js_sys::Reflect::set(&js_event, &"message".into(), &visitor.message.into());
                    let _ = js_sys::Reflect::set(&js_event, &"timestamp".into(), &timestamp.into());

                    let _ = callback.call1(&JsValue::NULL, &js_event);
                }
            });
        }
    }

    /// Collects the `message` field, with any other fields appended as `name=value`.
    #[derive(Default)]
    struct MessageVisitor {
        message: String,
    }

    impl MessageVisitor {
        fn push(&mut self, name: &str, value: String) {
            if name == "message" {
                self.message.insert_str(0, &value);
            } else {
                if !self.message.is_empty() {
                    self.message.push(' ');
                }
                self.message.push_str(&format!("{}={}", name, value));
            }
        }
    }

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.push(field.name(), format!("{:?}", value));
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.push(field.name(), value.to_string());
        }
    }

    /// Initialize the WASM module (sets up panic hook and tracing for better debugging).
    ///
    /// Accepts an optional configuration object:
    /// - `init()` - console-only logging (default)
    /// - `init({})` - console-only logging
    /// - `init({ logger: (event) => {...} })` - callback + console logging
    ///
    /// The logger callback receives events with: `{ level, target, message, timestamp }`
    #[wasm_bindgen]
    pub fn init(config: Option<js_sys::Object>) {
        console_error_panic_hook::set_once();

        let callback = config
            .as_ref()
            .and_then(|cfg| js_sys::Reflect::get(cfg, &"logger".into()).ok())
            .and_then(|v| v.dyn_into::<js_sys::Function>().ok());

        let console_config = tracing_wasm::WASMLayerConfigBuilder::new()
            .set_max_level(tracing::Level::DEBUG)
            .build();

        match callback {
            Some(cb) => {
                LOGGER_CALLBACK.with(|cell| {
                    *cell.borrow_mut() = Some(cb);
                });
                let subscriber = tracing_subscriber::registry()
                    .with(JsCallbackLayer)
                    .with(tracing_wasm::WASMLayer::new(console_config));
                tracing::subscriber::set_global_default(subscriber).ok();
            }
            None => tracing_wasm::set_as_global_default_with_config(console_config),
        }

        tracing::info!("docsync-wasm {} initialized", env!("CARGO_PKG_VERSION"));
    }

    /// Get version string
    #[wasm_bindgen]
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}

// Re-export wasm_impl contents at crate root for wasm32 targets
#[cfg(target_arch = "wasm32")]
pub use wasm_impl::*;
