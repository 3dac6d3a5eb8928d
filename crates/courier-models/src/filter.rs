//! Field filters for store scans.

use crate::dependency::Dependency;
use crate::ids::MessageId;
use crate::message::{Message, MessageState};

/// Filter criteria for scanning messages.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Filter by lifecycle state.
    pub state: Option<MessageState>,
    /// Filter by content signature.
    pub signature: Option<String>,
    /// Filter by exact subject.
    pub subject: Option<String>,
}

impl MessageFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages that are neither reserved nor finished.
    pub fn pending() -> Self {
        Self::new().with_state(MessageState::Pending)
    }

    /// Sets the state filter.
    pub fn with_state(mut self, state: MessageState) -> Self {
        self.state = Some(state);
        self
    }

    /// Sets the signature filter.
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Sets the subject filter.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Returns true if the message matches this filter.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(state) = self.state {
            if message.state() != state {
                return false;
            }
        }

        if let Some(ref signature) = self.signature {
            if message.signature != *signature {
                return false;
            }
        }

        if let Some(ref subject) = self.subject {
            if message.subject != *subject {
                return false;
            }
        }

        true
    }
}

/// Filter criteria for scanning dependency edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyFilter {
    pub preceding: Option<MessageId>,
    pub dependent: Option<MessageId>,
}

impl DependencyFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Edges whose preceding message is `id`.
    pub fn preceding(id: &MessageId) -> Self {
        Self {
            preceding: Some(id.clone()),
            dependent: None,
        }
    }

    /// Edges whose dependent message is `id`.
    pub fn dependent(id: &MessageId) -> Self {
        Self {
            preceding: None,
            dependent: Some(id.clone()),
        }
    }

    /// The single edge from `preceding` to `dependent`.
    pub fn between(preceding: &MessageId, dependent: &MessageId) -> Self {
        Self {
            preceding: Some(preceding.clone()),
            dependent: Some(dependent.clone()),
        }
    }

    /// Returns true if the edge matches this filter.
    pub fn matches(&self, edge: &Dependency) -> bool {
        if let Some(ref preceding) = self.preceding {
            if edge.preceding != *preceding {
                return false;
            }
        }

        if let Some(ref dependent) = self.dependent {
            if edge.dependent != *dependent {
                return false;
            }
        }

        true
    }
}
