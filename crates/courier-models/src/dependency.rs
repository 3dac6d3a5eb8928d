//! Precedence edges between messages.

use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// A directed precedence constraint: `preceding` must finish before
/// `dependent` may be reserved.
///
/// Edges are only ever created or deleted, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// Message that has to finish first.
    pub preceding: MessageId,
    /// Message held back until `preceding` finishes.
    pub dependent: MessageId,
}

impl Dependency {
    pub fn new(preceding: MessageId, dependent: MessageId) -> Self {
        Self {
            preceding,
            dependent,
        }
    }
}
