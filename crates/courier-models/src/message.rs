//! Message records.
//!
//! A message is one unit of queued work. Its lifecycle is tracked purely
//! through timestamps:
//!
//! ```text
//! pending ──reserve──> reserved ──finish──> finished
//! ```
//!
//! `reserved_at` and `finished_at` are each set at most once and never
//! cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::MessageId;

/// Lifecycle state of a message, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Neither reserved nor finished.
    Pending,
    /// Claimed by a consumer, not finished yet.
    Reserved,
    /// Processing completed.
    Finished,
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageState::Pending => "pending",
            MessageState::Reserved => "reserved",
            MessageState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Computes the content signature of a subject/body pair.
///
/// The signature is the lowercase hex SHA-256 of `subject=<subject>,body=<body>`,
/// so two messages with identical subject and body always share a signature
/// whatever their priority, schedule, or state.
pub fn signature(subject: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("subject={},body={}", subject, body).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for the message.
    pub id: MessageId,

    /// Store-assigned insertion counter, used to keep arrival order among
    /// messages created within the same clock tick.
    #[serde(default)]
    pub sequence: u64,

    /// When the message was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,

    /// The message is not eligible for reservation before this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// When the message was reserved by a consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<DateTime<Utc>>,

    /// When processing of the message finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Higher values are preferred among messages created at the same time.
    #[serde(default)]
    pub priority: i64,

    /// Subject used to route the message to listeners.
    pub subject: String,

    /// Opaque payload.
    pub body: String,

    /// Content signature, see [`signature`].
    pub signature: String,
}

impl Message {
    /// Creates a new pending message.
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        let subject = subject.into();
        let body = body.into();
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            sequence: 0,
            created_at: now,
            updated_at: now,
            scheduled_for: None,
            reserved_at: None,
            finished_at: None,
            priority: 0,
            signature: signature(&subject, &body),
            subject,
            body,
        }
    }

    /// Returns the lifecycle state of the message.
    pub fn state(&self) -> MessageState {
        if self.finished_at.is_some() {
            MessageState::Finished
        } else if self.reserved_at.is_some() {
            MessageState::Reserved
        } else {
            MessageState::Pending
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Returns true if the message is scheduled for a time after `now`.
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_some_and(|at| at > now)
    }

    /// Marks the message as reserved.
    ///
    /// Returns false and leaves the record untouched if it was already
    /// reserved or finished.
    pub fn mark_reserved(&mut self, now: DateTime<Utc>) -> bool {
        if self.reserved_at.is_some() || self.finished_at.is_some() {
            return false;
        }
        self.reserved_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Marks the message as finished.
    ///
    /// Returns false and leaves the record untouched unless the message is
    /// reserved and not yet finished.
    pub fn mark_finished(&mut self, now: DateTime<Utc>) -> bool {
        if self.reserved_at.is_none() || self.finished_at.is_some() {
            return false;
        }
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }
}
