//! docsync-cli library: the native hosts of the sync engine.
//!
//! Exposes the file-backed store, the directory remote and the command
//! runner so integration tests can drive them directly.

pub mod cli;
pub mod dir_remote;
pub mod file_kv;

pub use cli::{Cli, Command, NoteAction, TaskAction, execute};
pub use dir_remote::DirRemote;
pub use file_kv::FileKv;
