//! Event names and the payload shapes they carry.
//!
//! The event string decides the payload shape; see
//! [`RawEnvelope::decode_payload`](crate::envelope::RawEnvelope::decode_payload).
//!
//! ```text
//! Event                 | Queue        | Payload
//! ----------------------|--------------|------------------
//! journal.index         | ai_tasks     | JournalIndex
//! journal.delete        | ai_tasks     | JournalDelete
//! guidance.request      | ai_tasks     | GuidanceRequest
//! guidance.response     | ai_response  | GuidanceResponse
//! guidance.complete     | ai_response  | (ignored)
//! user_journal.create   | sync_data    | UserJournal
//! emotion_log.create    | sync_data    | EmotionLog
//! chatlog.create        | sync_data    | GuiderChatlog
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const JOURNAL_INDEX: &str = "journal.index";
pub const JOURNAL_DELETE: &str = "journal.delete";

pub const GUIDANCE_REQUEST: &str = "guidance.request";
pub const GUIDANCE_RESPONSE: &str = "guidance.response";
/// Sent by the worker after the last response chunk of a request
pub const GUIDANCE_COMPLETE: &str = "guidance.complete";

pub const USER_JOURNAL_CREATE: &str = "user_journal.create";
pub const EMOTION_LOG_CREATE: &str = "emotion_log.create";
pub const CHATLOG_CREATE: &str = "chatlog.create";
/// Older workers spell the chat log event with an underscore
pub const LEGACY_CHATLOG_CREATE: &str = "chat_log.create";

/// Every event the write-back queue is expected to carry.
pub const WRITE_BACK_EVENTS: &[&str] = &[
    USER_JOURNAL_CREATE,
    EMOTION_LOG_CREATE,
    CHATLOG_CREATE,
    LEGACY_CHATLOG_CREATE,
];

/// A journal entry as stored in the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJournal {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_html: Option<String>,
    /// 1-10 scale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood_score: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood_label: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub emotion: String,
    pub source: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

/// One message of the AI guider conversation attached to a journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuiderChatlog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub journal_id: Uuid,
    pub sender_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Sent to the AI worker so it can index a journal for retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalIndex {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood_score: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood_label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&UserJournal> for JournalIndex {
    fn from(journal: &UserJournal) -> Self {
        Self {
            id: journal.id,
            user_id: journal.user_id,
            title: journal.title.clone(),
            content: journal.content.clone(),
            mood_score: journal.mood_score,
            mood_label: journal.mood_label.clone(),
            created_at: journal.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalDelete {
    pub id: Uuid,
    pub user_id: Uuid,
}

/// Body of the guidance endpoint, forwarded to the worker as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceRequest {
    pub current_week: i32,
    pub chatbot_interaction: String,
    pub emotion_tracking: String,
}

/// One streamed piece of guidance. Field names match what the worker emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceResponse {
    pub suggest_mindfulness_tip: String,
    pub explaination: String,
}
