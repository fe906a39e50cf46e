//! Async execution of session remote work.
//!
//! `SyncDriver` owns a `SyncSession` and a `RemoteStore` and runs the
//! session's queued `RemoteCommand`s until none remain. Commands queued
//! together run concurrently, so the two document types sync in parallel;
//! the session itself guarantees a single save in flight per type.

use crate::document::DocumentType;
use crate::error::Result;
use crate::owner::OwnerId;
use crate::remote::{self, LoadOutcome, RemoteId, RemoteStore};
use crate::scheduler::SaveTicket;
use crate::session::{LifecycleEvent, LoadTicket, RemoteCommand, SyncSession};
use crate::store::KvBackend;
use futures::future::join_all;
use tracing::trace;

enum Completion {
    Load(LoadTicket, remote::Result<LoadOutcome>),
    Save(SaveTicket, remote::Result<RemoteId>),
    Delete(OwnerId, DocumentType, remote::Result<()>),
}

async fn execute<R: RemoteStore>(remote: &R, command: RemoteCommand) -> Completion {
    match command {
        RemoteCommand::Load(ticket) => {
            let result = remote.load(&ticket.owner, ticket.doc_type).await;
            Completion::Load(ticket, result)
        }
        RemoteCommand::Save {
            ticket,
            content,
            existing,
        } => {
            let result = remote.save(&ticket.owner, &content, existing.as_ref()).await;
            Completion::Save(ticket, result)
        }
        RemoteCommand::Delete {
            owner,
            doc_type,
            remote_id,
        } => {
            let result = remote.delete(&owner, doc_type, &remote_id).await;
            Completion::Delete(owner, doc_type, result)
        }
    }
}

pub struct SyncDriver<B, R> {
    session: SyncSession<B>,
    remote: R,
}

impl<B: KvBackend, R: RemoteStore> SyncDriver<B, R> {
    pub fn new(session: SyncSession<B>, remote: R) -> Self {
        Self { session, remote }
    }

    pub fn session(&self) -> &SyncSession<B> {
        &self.session
    }

    /// Direct access for synchronous operations (edits, queries). Call `run`
    /// afterwards if the operation may have queued remote work.
    pub fn session_mut(&mut self) -> &mut SyncSession<B> {
        &mut self.session
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn into_parts(self) -> (SyncSession<B>, R) {
        (self.session, self.remote)
    }

    /// Executes queued commands, including any their completions queue,
    /// until the session has nothing left to send.
    pub async fn run(&mut self) {
        loop {
            let commands = self.session.take_commands();
            if commands.is_empty() {
                break;
            }
            trace!("Running {} remote commands", commands.len());
            let remote = &self.remote;
            let completions = join_all(commands.into_iter().map(|command| execute(remote, command))).await;
            for completion in completions {
                match completion {
                    Completion::Load(ticket, result) => self.session.complete_load(ticket, result),
                    Completion::Save(ticket, result) => self.session.complete_save(ticket, result),
                    Completion::Delete(owner, ty, result) => self.session.complete_delete(&owner, ty, result),
                }
            }
        }
    }

    /// Sets the owner and waits for the login loads.
    pub async fn set_owner(&mut self, owner: OwnerId) {
        self.session.set_owner(owner);
        self.run().await;
    }

    pub async fn clear_owner(&mut self) {
        self.session.clear_owner();
        self.run().await;
    }

    pub async fn tick(&mut self) {
        self.session.tick();
        self.run().await;
    }

    pub async fn request_flush(&mut self, ty: DocumentType) -> Result<()> {
        self.session.request_flush(ty)?;
        self.run().await;
        Ok(())
    }

    pub async fn lifecycle(&mut self, event: LifecycleEvent) {
        self.session.lifecycle(event);
        self.run().await;
    }

    pub async fn clear(&mut self, ty: DocumentType) -> Result<()> {
        self.session.clear(ty)?;
        self.run().await;
        Ok(())
    }

    pub async fn refresh(&mut self) -> Result<()> {
        self.session.refresh()?;
        self.run().await;
        Ok(())
    }
}
