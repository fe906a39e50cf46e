//! Command-line front end.
//!
//! Every invocation behaves like one short-lived tab: it opens the local
//! store, logs in (running the login loads against the remote directory),
//! applies one command and flushes on the way out as if the page unloaded.

use crate::dir_remote::DirRemote;
use crate::file_kv::FileKv;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use docsync_core::{
    BroadcastHub, Capabilities, DocStatus, DocumentContent, DocumentType, LifecycleEvent, OwnerId, Priority,
    SyncConfig, SyncDriver, SyncSession, SystemClock, TabId, Task, TaskEdit, TaskId, open_channel,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(about = "Local-first task list and note, synced through a remote directory")]
pub struct Cli {
    /// Directory holding the local store
    #[arg(long, default_value = ".docsync")]
    pub data_dir: PathBuf,

    /// Directory standing in for the remote API [default: <data-dir>/remote]
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,

    /// Owner to act as; omit to work anonymously (local only)
    #[arg(long)]
    pub owner: Option<OwnerId>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Work with the task list
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Work with the note
    Note {
        #[command(subcommand)]
        action: NoteAction,
    },
    /// Pull both documents from the remote
    Sync,
    /// Print the status of both documents as JSON
    Status,
}

#[derive(Subcommand, Debug)]
pub enum TaskAction {
    List,
    /// Add a task at the top of the list
    Add {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Toggle the done flag of task N
    Done { index: usize },
    /// Remove task N
    Rm { index: usize },
    /// Move task FROM to position TO
    Move { from: usize, to: usize },
    /// Set the priority (low, normal, high) of task N
    Priority { index: usize, priority: Priority },
    /// Remove every finished task
    ClearDone,
    /// Delete the whole list, locally and remotely
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum NoteAction {
    Show,
    /// Replace the note text
    Set { text: Vec<String> },
    /// Replace the transcription
    Transcription { text: Vec<String> },
    /// Delete the note, locally and remotely
    Clear,
}

type Driver = SyncDriver<FileKv, DirRemote>;

impl Cli {
    pub fn remote_path(&self) -> PathBuf {
        self.remote_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("remote"))
    }
}

/// Runs one command and returns what should be printed.
pub async fn execute(cli: &Cli, config: SyncConfig) -> Result<String> {
    let local_path = cli.data_dir.join("local");
    let local = FileKv::open(&local_path).with_context(|| format!("opening {}", local_path.display()))?;

    let hub = Arc::new(BroadcastHub::new());
    let channel = open_channel(
        &hub,
        Capabilities { native_channel: true },
        TabId::generate(),
        &config.key_prefix,
    );
    let session = SyncSession::new(config, Arc::new(SystemClock), local, channel);
    let mut driver = SyncDriver::new(session, DirRemote::new(cli.remote_path()));

    let owner = cli.owner.clone().unwrap_or_else(OwnerId::anonymous);
    debug!("Running {:?} as {}", cli.command, owner);
    driver.set_owner(owner).await;

    let output = match &cli.command {
        Command::Tasks { action } => run_tasks(&mut driver, action).await?,
        Command::Note { action } => run_note(&mut driver, action).await?,
        Command::Sync => {
            driver.refresh().await?;
            summary(&driver)
        }
        Command::Status => status_json(&driver)?,
    };

    driver.lifecycle(LifecycleEvent::Unloading).await;
    for ty in DocumentType::ALL {
        if let Some(err) = driver.session().status(ty).sync.last_error {
            warn!("{} not synced: {}", ty, err);
        }
    }
    Ok(output)
}

async fn run_tasks(driver: &mut Driver, action: &TaskAction) -> Result<String> {
    let edit = match action {
        TaskAction::List => return Ok(render_tasks(tasks(driver))),
        TaskAction::Clear => {
            driver.clear(DocumentType::TaskList).await?;
            return Ok("Task list cleared".to_string());
        }
        TaskAction::Add { text } => TaskEdit::Add(text.join(" ")),
        TaskAction::Done { index } => TaskEdit::Toggle(task_id(driver, *index)?),
        TaskAction::Rm { index } => TaskEdit::Remove(task_id(driver, *index)?),
        TaskAction::Move { from, to } => {
            let len = tasks(driver).len();
            if *from == 0 || *to == 0 || *from > len || *to > len {
                bail!("positions must be between 1 and {}", len);
            }
            TaskEdit::Move {
                from: from - 1,
                to: to - 1,
            }
        }
        TaskAction::Priority { index, priority } => TaskEdit::SetPriority(task_id(driver, *index)?, *priority),
        TaskAction::ClearDone => TaskEdit::ClearDone,
    };
    if !driver.session_mut().edit_tasks(edit)? {
        debug!("Task list unchanged");
    }
    driver.request_flush(DocumentType::TaskList).await?;
    Ok(render_tasks(tasks(driver)))
}

async fn run_note(driver: &mut Driver, action: &NoteAction) -> Result<String> {
    match action {
        NoteAction::Show => {}
        NoteAction::Set { text } => driver.session_mut().set_note(text.join(" "))?,
        NoteAction::Transcription { text } => driver.session_mut().set_transcription(text.join(" "))?,
        NoteAction::Clear => {
            driver.clear(DocumentType::Note).await?;
            return Ok("Note cleared".to_string());
        }
    }
    if !matches!(action, NoteAction::Show) {
        driver.request_flush(DocumentType::Note).await?;
    }
    Ok(render_note(driver.session().content(DocumentType::Note)))
}

fn tasks(driver: &Driver) -> &[Task] {
    driver
        .session()
        .content(DocumentType::TaskList)
        .as_tasks()
        .unwrap_or_default()
}

/// Resolves a 1-based list position.
fn task_id(driver: &Driver, index: usize) -> Result<TaskId> {
    match index.checked_sub(1).and_then(|i| tasks(driver).get(i)) {
        Some(task) => Ok(task.id.clone()),
        None => bail!("no task #{}", index),
    }
}

fn render_tasks(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks".to_string();
    }
    tasks
        .iter()
        .enumerate()
        .map(|(i, task)| {
            let mark = if task.done { "x" } else { " " };
            let priority = match task.priority {
                Priority::High => " (high)",
                Priority::Low => " (low)",
                Priority::Normal => "",
            };
            format!("{:>2}. [{}] {}{}", i + 1, mark, task.text, priority)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_note(content: &DocumentContent) -> String {
    let Some(note) = content.as_note() else {
        return String::new();
    };
    if note.transcription.trim().is_empty() {
        return note.notes.clone();
    }
    format!("{}\n--- transcription ---\n{}", note.notes, note.transcription)
}

fn summary(driver: &Driver) -> String {
    DocumentType::ALL
        .iter()
        .map(|ty| {
            let status = driver.session().status(*ty);
            match status.sync.last_error {
                Some(err) => format!("{}: {}", ty.wire_name(), err),
                None => format!("{}: in sync", ty.wire_name()),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn status_json(driver: &Driver) -> Result<String> {
    let status = |ty: DocumentType| -> DocStatus { driver.session().status(ty) };
    let value = json!({
        "owner": driver.session().owner(),
        "TODO": status(DocumentType::TaskList),
        "NOTES": status(DocumentType::Note),
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_commands() {
        let cli = Cli::try_parse_from(["docsync", "--owner", "42", "tasks", "priority", "2", "high"]).unwrap();
        assert_eq!(cli.owner, Some(OwnerId::new("42").unwrap()));
        match cli.command {
            Command::Tasks {
                action: TaskAction::Priority { index, priority },
            } => {
                assert_eq!(index, 2);
                assert_eq!(priority, Priority::High);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_invalid_owner_is_rejected() {
        assert!(Cli::try_parse_from(["docsync", "--owner", "a b", "status"]).is_err());
    }

    #[test]
    fn test_remote_defaults_under_data_dir() {
        let cli = Cli::try_parse_from(["docsync", "--data-dir", "/tmp/x", "sync"]).unwrap();
        assert_eq!(cli.remote_path(), PathBuf::from("/tmp/x/remote"));
    }

    #[test]
    fn test_render_tasks() {
        let mut done = Task::new("ship it", 0);
        done.done = true;
        done.priority = Priority::High;
        let open = Task::new("write docs", 0);
        assert_eq!(render_tasks(&[done, open]), " 1. [x] ship it (high)\n 2. [ ] write docs");
        assert_eq!(render_tasks(&[]), "No tasks");
    }
}
