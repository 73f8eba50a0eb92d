//! Data-layer seam.
//!
//! The relay never owns the primary store. It calls into a [`DataStore`]
//! for the few operations its handlers and endpoints need. Write-back
//! inserts are insert-or-ignore: receiving the same record twice stores it
//! once, which is what makes at-least-once delivery safe.

use crate::events::{EmotionLog, GuiderChatlog, UserJournal};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),

    /// Transient failure; the operation may succeed if retried
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of an insert-or-ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Created,
    /// A record with the same id was already present and was left untouched
    AlreadyExists,
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn insert_journal(&self, journal: &UserJournal) -> Result<Inserted, StoreError>;

    async fn get_journal(&self, id: Uuid) -> Result<UserJournal, StoreError>;

    async fn delete_journal(&self, id: Uuid) -> Result<UserJournal, StoreError>;

    async fn insert_emotion_log(&self, log: &EmotionLog) -> Result<Inserted, StoreError>;

    async fn insert_chatlog(&self, chatlog: &GuiderChatlog) -> Result<Inserted, StoreError>;
}

#[derive(Default)]
struct Tables {
    journals: HashMap<Uuid, UserJournal>,
    emotion_logs: HashMap<Uuid, EmotionLog>,
    chatlogs: HashMap<Uuid, GuiderChatlog>,
    /// Remaining inserts to fail with `Unavailable`
    failures: u32,
}

/// Store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` inserts fail as if the store were down.
    pub fn fail_next_inserts(&self, count: u32) {
        self.tables().failures = count;
    }

    pub fn journal_count(&self) -> usize {
        self.tables().journals.len()
    }

    pub fn emotion_log_count(&self) -> usize {
        self.tables().emotion_logs.len()
    }

    pub fn chatlog_count(&self) -> usize {
        self.tables().chatlogs.len()
    }

    pub fn chatlogs_for(&self, journal_id: Uuid) -> Vec<GuiderChatlog> {
        let mut logs: Vec<GuiderChatlog> = self
            .tables()
            .chatlogs
            .values()
            .filter(|c| c.journal_id == journal_id)
            .cloned()
            .collect();
        logs.sort_by_key(|c| c.created_at);
        logs
    }
}

fn insert_or_ignore<T: Clone>(
    table: &mut HashMap<Uuid, T>,
    id: Uuid,
    record: &T,
) -> Inserted {
    match table.entry(id) {
        std::collections::hash_map::Entry::Occupied(_) => Inserted::AlreadyExists,
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(record.clone());
            Inserted::Created
        }
    }
}

fn take_failure(tables: &mut Tables) -> Result<(), StoreError> {
    if tables.failures > 0 {
        tables.failures -= 1;
        return Err(StoreError::Unavailable("injected failure".to_string()));
    }
    Ok(())
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn insert_journal(&self, journal: &UserJournal) -> Result<Inserted, StoreError> {
        let mut tables = self.tables();
        take_failure(&mut tables)?;
        Ok(insert_or_ignore(&mut tables.journals, journal.id, journal))
    }

    async fn get_journal(&self, id: Uuid) -> Result<UserJournal, StoreError> {
        self.tables()
            .journals
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete_journal(&self, id: Uuid) -> Result<UserJournal, StoreError> {
        self.tables()
            .journals
            .remove(&id)
            .ok_or(StoreError::NotFound(id))
    }

    async fn insert_emotion_log(&self, log: &EmotionLog) -> Result<Inserted, StoreError> {
        let mut tables = self.tables();
        take_failure(&mut tables)?;
        Ok(insert_or_ignore(&mut tables.emotion_logs, log.id, log))
    }

    async fn insert_chatlog(&self, chatlog: &GuiderChatlog) -> Result<Inserted, StoreError> {
        let mut tables = self.tables();
        take_failure(&mut tables)?;
        Ok(insert_or_ignore(&mut tables.chatlogs, chatlog.id, chatlog))
    }
}
