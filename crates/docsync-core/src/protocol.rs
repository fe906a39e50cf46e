//! Wire protocol of the remote document API.
//!
//! Three JSON-over-HTTP endpoints (`todonotes/load`, `todonotes/save`,
//! `todonotes/delete`), each answered with
//! `{"status":"ok"|"error","message":..,"ID":..,"data":..}`.
//! This module only builds request bodies and interprets responses; sending
//! them is left to an `HttpPost` implementation, and `ApiRemote` glues the
//! two into a `RemoteStore`.

use crate::document::{DocumentContent, DocumentType, Task};
use crate::owner::OwnerId;
use crate::remote::{LoadOutcome, RemoteDocument, RemoteError, RemoteId, RemoteStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

pub const LOAD_ENDPOINT: &str = "todonotes/load";
pub const SAVE_ENDPOINT: &str = "todonotes/save";
pub const DELETE_ENDPOINT: &str = "todonotes/delete";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Not authorized ({0})")]
    Unauthorized(u16),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Server reported error: {0}")]
    Server(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected response: {0}")]
    Shape(String),

    #[error("No credentials; log in first")]
    NoCredentials,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<ProtocolError> for RemoteError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Unauthorized(_) | ProtocolError::NoCredentials => RemoteError::Auth(err.to_string()),
            ProtocolError::Status(_) | ProtocolError::Server(_) => RemoteError::Network(err.to_string()),
            ProtocolError::Json(_) | ProtocolError::Shape(_) => RemoteError::MalformedPayload(err.to_string()),
        }
    }
}

/// Login material supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

/// Numeric-looking ids go on the wire as numbers, like the server hands them out.
fn id_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(id),
    }
}

#[derive(Serialize)]
struct LoadRequest<'a> {
    username: &'a str,
    token: &'a str,
    typ: DocumentType,
    user_id: Value,
}

#[derive(Serialize)]
struct SaveRequest<'a> {
    username: &'a str,
    token: &'a str,
    typ: DocumentType,
    user_id: Value,
    /// `null` inserts, a value updates.
    id: Option<&'a RemoteId>,
    obsah: SaveBody<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum SaveBody<'a> {
    Items { items: &'a [Task], settings: ItemSettings },
    Text { text: String, settings: TextSettings },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemSettings {
    last_modified: u64,
    item_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TextSettings {
    last_modified: u64,
    length: usize,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    username: &'a str,
    token: &'a str,
    typ: DocumentType,
    user_id: Value,
    id: &'a RemoteId,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: Option<String>,
    message: Option<String>,
    #[serde(rename = "ID")]
    id: Option<RemoteId>,
    data: Option<Value>,
}

pub fn encode_load(creds: &Credentials, owner: &OwnerId, ty: DocumentType) -> Result<String> {
    Ok(serde_json::to_string(&LoadRequest {
        username: &creds.username,
        token: &creds.token,
        typ: ty,
        user_id: id_value(owner.as_str()),
    })?)
}

pub fn encode_save(
    creds: &Credentials,
    owner: &OwnerId,
    content: &DocumentContent,
    existing: Option<&RemoteId>,
    now_ms: u64,
) -> Result<String> {
    let obsah = match content {
        DocumentContent::Tasks(tasks) => SaveBody::Items {
            items: tasks,
            settings: ItemSettings {
                last_modified: now_ms,
                item_count: tasks.len(),
            },
        },
        DocumentContent::Note(note) => {
            let text = serde_json::to_string(note)?;
            let length = text.encode_utf16().count();
            SaveBody::Text {
                text,
                settings: TextSettings {
                    last_modified: now_ms,
                    length,
                },
            }
        }
    };
    Ok(serde_json::to_string(&SaveRequest {
        username: &creds.username,
        token: &creds.token,
        typ: content.doc_type(),
        user_id: id_value(owner.as_str()),
        id: existing,
        obsah,
    })?)
}

pub fn encode_delete(creds: &Credentials, owner: &OwnerId, ty: DocumentType, id: &RemoteId) -> Result<String> {
    Ok(serde_json::to_string(&DeleteRequest {
        username: &creds.username,
        token: &creds.token,
        typ: ty,
        user_id: id_value(owner.as_str()),
        id,
    })?)
}

fn check_status(http_status: u16) -> Result<()> {
    match http_status {
        200..=299 => Ok(()),
        401 | 403 => Err(ProtocolError::Unauthorized(http_status)),
        other => Err(ProtocolError::Status(other)),
    }
}

fn parse_ok(body: &str) -> Result<ApiResponse> {
    let response: ApiResponse = serde_json::from_str(body)?;
    match response.status.as_deref() {
        Some("ok") => Ok(response),
        Some("error") => Err(ProtocolError::Server(
            response.message.unwrap_or_else(|| "unspecified error".into()),
        )),
        Some(other) => Err(ProtocolError::Shape(format!("unknown status {other:?}"))),
        None => Err(ProtocolError::Shape("missing status".into())),
    }
}

fn field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

/// Finds the task array in the shapes the server has been seen to return.
fn extract_items(result: &Value) -> Value {
    [
        field(result, &["content", "items"]),
        field(result, &["content"]),
        Some(result),
    ]
    .into_iter()
    .flatten()
    .find(|v| v.is_array())
    .cloned()
    .unwrap_or(Value::Array(Vec::new()))
}

/// Finds the note text in the shapes the server has been seen to return.
fn extract_text(result: &Value) -> Value {
    let candidates = [
        field(result, &["content", "text"]),
        field(result, &["text"]),
        field(result, &["content"]).filter(|v| v.is_string()),
        Some(result).filter(|v| v.is_string()),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()))
}

/// Interprets a load response. A 404, or an `ok` without data or id, means
/// the remote has no document.
pub fn decode_load(ty: DocumentType, http_status: u16, body: &str, now_ms: u64) -> Result<LoadOutcome> {
    if http_status == 404 {
        return Ok(LoadOutcome::NotFound);
    }
    check_status(http_status)?;
    let response = parse_ok(body)?;

    let result = response.data.unwrap_or(Value::Null);
    let remote_id = response
        .id
        .or_else(|| {
            field(&result, &["ID"])
                .or_else(|| field(&result, &["id"]))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        });
    if result.is_null() && remote_id.is_none() {
        return Ok(LoadOutcome::NotFound);
    }

    let raw = match ty {
        DocumentType::TaskList => extract_items(&result),
        DocumentType::Note => extract_text(&result),
    };
    let content = DocumentContent::from_value(ty, raw, now_ms)
        .map_err(|e| ProtocolError::Shape(e.to_string()))?;
    Ok(LoadOutcome::Found(RemoteDocument { remote_id, content }))
}

/// Interprets a save response, falling back to the id the save was sent with.
pub fn decode_save(http_status: u16, body: &str, existing: Option<&RemoteId>) -> Result<RemoteId> {
    check_status(http_status)?;
    let response = parse_ok(body)?;
    response
        .id
        .or_else(|| existing.cloned())
        .ok_or_else(|| ProtocolError::Shape("save response without ID".into()))
}

/// Interprets a delete response. Deleting something already gone succeeds.
pub fn decode_delete(http_status: u16, body: &str) -> Result<()> {
    if http_status == 404 {
        return Ok(());
    }
    check_status(http_status)?;
    parse_ok(body).map(|_| ())
}

/// HTTP response as far as the protocol cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Sends a JSON body to an API endpoint.
///
/// Transport failures (no connection, timeout) are `RemoteError::Network`.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(not(target_arch = "wasm32"))]
pub trait HttpPost: Send + Sync {
    async fn post(&self, endpoint: &str, body: String) -> std::result::Result<HttpResponse, RemoteError>;
}

/// Sends a JSON body to an API endpoint (WASM version without Send + Sync).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(target_arch = "wasm32")]
pub trait HttpPost {
    async fn post(&self, endpoint: &str, body: String) -> std::result::Result<HttpResponse, RemoteError>;
}

/// `RemoteStore` speaking the document API over an `HttpPost`.
pub struct ApiRemote<P> {
    http: P,
    credentials: RwLock<Option<Credentials>>,
    clock: std::sync::Arc<dyn crate::clock::Clock>,
}

impl<P: HttpPost> ApiRemote<P> {
    pub fn new(http: P, clock: std::sync::Arc<dyn crate::clock::Clock>) -> Self {
        Self {
            http,
            credentials: RwLock::new(None),
            clock,
        }
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.write().unwrap_or_else(|e| e.into_inner()) = credentials;
    }

    fn credentials(&self) -> Result<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ProtocolError::NoCredentials)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<P: HttpPost> RemoteStore for ApiRemote<P> {
    async fn load(&self, owner: &OwnerId, ty: DocumentType) -> crate::remote::Result<LoadOutcome> {
        let body = encode_load(&self.credentials()?, owner, ty)?;
        let response = self.http.post(LOAD_ENDPOINT, body).await?;
        debug!("Load {} for {} -> HTTP {}", ty, owner, response.status);
        Ok(decode_load(ty, response.status, &response.body, self.clock.now_ms())?)
    }

    async fn save(
        &self,
        owner: &OwnerId,
        content: &DocumentContent,
        existing: Option<&RemoteId>,
    ) -> crate::remote::Result<RemoteId> {
        let body = encode_save(&self.credentials()?, owner, content, existing, self.clock.now_ms())?;
        let response = self.http.post(SAVE_ENDPOINT, body).await?;
        debug!("Save {} for {} -> HTTP {}", content.doc_type(), owner, response.status);
        Ok(decode_save(response.status, &response.body, existing)?)
    }

    async fn delete(&self, owner: &OwnerId, ty: DocumentType, id: &RemoteId) -> crate::remote::Result<()> {
        let body = encode_delete(&self.credentials()?, owner, ty, id)?;
        let response = self.http.post(DELETE_ENDPOINT, body).await?;
        debug!("Delete {} {} for {} -> HTTP {}", ty, id, owner, response.status);
        Ok(decode_delete(response.status, &response.body)?)
    }
}
