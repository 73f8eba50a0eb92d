//! Handler registry for consumed queues.
//!
//! A [`HandlerTable`] maps event names to [`Handler`]s. The set of events is
//! closed: a table is built once per queue at startup and checked with
//! [`HandlerTable::validate`] against the events that queue is expected to
//! carry, so a typo in a registration fails startup instead of silently
//! dropping messages.
//!
//! Events that reach a queue without a handler are still tolerated at run
//! time; the dispatcher acknowledges and logs them.
//!
//! # Write-back
//!
//! ```text
//! Event                 | Shape          | Store call
//! ----------------------|----------------|---------------------
//! user_journal.create   | UserJournal    | insert_journal
//! emotion_log.create    | EmotionLog     | insert_emotion_log
//! chatlog.create        | GuiderChatlog  | insert_chatlog
//! chat_log.create       | GuiderChatlog  | insert_chatlog
//! ```
//!
//! # Custom handlers
//!
//! ```rust,ignore
//! use tranquara_relay::handlers::{Handler, HandlerError};
//! use tranquara_relay::envelope::RawEnvelope;
//! use tranquara_relay::store::Inserted;
//! use async_trait::async_trait;
//!
//! struct Audit;
//!
//! #[async_trait]
//! impl Handler for Audit {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     async fn handle(&self, envelope: &RawEnvelope) -> Result<Inserted, HandlerError> {
//!         tracing::info!(event = %envelope.event, "seen");
//!         Ok(Inserted::Created)
//!     }
//! }
//! ```

use crate::envelope::{CodecError, RawEnvelope};
use crate::events::{self, EmotionLog, GuiderChatlog, UserJournal};
use crate::store::{DataStore, Inserted, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors a handler can fail with.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload does not have the shape the event requires
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl HandlerError {
    /// Whether processing the same message again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Store(StoreError::Unavailable(_)))
    }
}

/// Errors found while validating a handler table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler registered for unexpected event '{0}'")]
    UnexpectedEvent(String),

    #[error("no handler registered for event '{0}'")]
    MissingHandler(String),
}

/// Applies the effect of one event.
///
/// Handlers must be idempotent: the same message can be delivered more than
/// once.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &RawEnvelope) -> Result<Inserted, HandlerError>;
}

/// Records the worker writes back into the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBack {
    UserJournal,
    EmotionLog,
    Chatlog,
}

impl WriteBack {
    pub fn for_event(event: &str) -> Option<Self> {
        match event {
            events::USER_JOURNAL_CREATE => Some(WriteBack::UserJournal),
            events::EMOTION_LOG_CREATE => Some(WriteBack::EmotionLog),
            events::CHATLOG_CREATE | events::LEGACY_CHATLOG_CREATE => Some(WriteBack::Chatlog),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WriteBack::UserJournal => "write-back:user_journal",
            WriteBack::EmotionLog => "write-back:emotion_log",
            WriteBack::Chatlog => "write-back:chatlog",
        }
    }
}

/// Decodes a write-back record and inserts it if absent.
pub struct WriteBackHandler {
    kind: WriteBack,
    store: Arc<dyn DataStore>,
}

impl WriteBackHandler {
    pub fn new(kind: WriteBack, store: Arc<dyn DataStore>) -> Self {
        Self { kind, store }
    }
}

#[async_trait]
impl Handler for WriteBackHandler {
    fn name(&self) -> &str {
        self.kind.name()
    }

    async fn handle(&self, envelope: &RawEnvelope) -> Result<Inserted, HandlerError> {
        let (id, inserted) = match self.kind {
            WriteBack::UserJournal => {
                let journal: UserJournal = envelope.decode_payload()?;
                (journal.id, self.store.insert_journal(&journal).await?)
            }
            WriteBack::EmotionLog => {
                let log: EmotionLog = envelope.decode_payload()?;
                (log.id, self.store.insert_emotion_log(&log).await?)
            }
            WriteBack::Chatlog => {
                let chatlog: GuiderChatlog = envelope.decode_payload()?;
                (chatlog.id, self.store.insert_chatlog(&chatlog).await?)
            }
        };

        debug!(
            handler = %self.name(),
            record_id = %id,
            outcome = ?inserted,
            "Write-back applied"
        );
        Ok(inserted)
    }
}

/// Event name to handler, for one queue.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for the write-back queue.
    pub fn write_back(store: Arc<dyn DataStore>) -> Self {
        let mut table = Self::new();
        for event in events::WRITE_BACK_EVENTS {
            if let Some(kind) = WriteBack::for_event(event) {
                table.on(event, Arc::new(WriteBackHandler::new(kind, store.clone())));
            }
        }
        table
    }

    /// Register `handler` for `event`, replacing any previous one.
    pub fn on(&mut self, event: &str, handler: Arc<dyn Handler>) {
        debug!(event = %event, handler = %handler.name(), "Registering handler");
        self.handlers.insert(event.to_string(), handler);
    }

    pub fn get(&self, event: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(event)
    }

    pub fn events(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check that exactly the `expected` events have handlers.
    pub fn validate(&self, expected: &[&str]) -> Result<(), RegistryError> {
        if let Some(extra) = self.events().into_iter().find(|e| !expected.contains(e)) {
            return Err(RegistryError::UnexpectedEvent(extra.to_string()));
        }
        if let Some(missing) = expected.iter().find(|e| !self.handlers.contains_key(**e)) {
            return Err(RegistryError::MissingHandler(missing.to_string()));
        }
        Ok(())
    }
}
