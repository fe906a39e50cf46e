//! File-backed key/value store.
//!
//! Each key is one file directly under the data directory. Key bytes
//! outside `[A-Za-z0-9_@-]` are percent-encoded in the file name, so every
//! key maps to exactly one file and back.

use docsync_core::store::{KvBackend, Result, StoreError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Durable store for the native binary.
pub struct FileKv {
    base_path: PathBuf,
}

impl FileKv {
    /// Creates the directory if needed.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(encode_key(key))
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let dir = fs::read_dir(&self.base_path).map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut keys = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| StoreError::Backend(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(key) = decode_key(&name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl KvBackend for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.full_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.full_path(key);
        // Write-then-rename so readers never see a torn value.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).map_err(|e| map_write_error(key, e))?;
        fs::rename(&tmp, &path).map_err(|e| map_write_error(key, e))?;
        trace!("Wrote {} ({} bytes)", key, value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}

fn map_write_error(key: &str, e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::StorageFull {
        StoreError::QuotaExceeded(key.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'@' => out.push(byte as char),
            // '.' included, so ".tmp" never collides with a key
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut iter = name.bytes();
    while let Some(byte) = iter.next() {
        if byte == b'%' {
            let hi = (iter.next()? as char).to_digit(16)?;
            let lo = (iter.next()? as char).to_digit(16)?;
            bytes.push((hi * 16 + lo) as u8);
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok()
}
