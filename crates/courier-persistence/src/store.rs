//! The durable store interface used by the queue engine.

use std::cmp::Ordering;

use courier_models::{Dependency, DependencyFilter, Message, MessageFilter, MessageId};

use crate::error::Result;

/// Durable storage for message and dependency-edge records.
///
/// Implementations must give read-after-write visibility to a single writer.
/// They do not serialize writers themselves; the queue engine wraps every
/// mutating sequence in a [`LockProvider`](crate::LockProvider) lock.
pub trait QueueStore: Send + Sync {
    /// Inserts a new message record.
    ///
    /// The store assigns the message's `sequence` and returns the record as
    /// persisted.
    fn insert_message(&self, message: Message) -> Result<Message>;

    /// Overwrites an existing message record.
    ///
    /// Fails with `NotFound` if no record with this id exists.
    fn update_message(&self, message: &Message) -> Result<()>;

    /// Loads a message by id.
    fn load_message(&self, id: &MessageId) -> Result<Option<Message>>;

    /// Returns messages matching `filter`, in reservation order (see
    /// [`reservation_order`]), truncated to `limit` if given.
    fn scan_messages(&self, filter: &MessageFilter, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Inserts a dependency edge.
    fn insert_dependency(&self, edge: &Dependency) -> Result<()>;

    /// Returns edges matching `filter`, truncated to `limit` if given.
    fn scan_dependencies(
        &self,
        filter: &DependencyFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Dependency>>;

    /// Deletes every edge matching `filter`, returning how many were removed.
    fn delete_dependencies(&self, filter: &DependencyFilter) -> Result<usize>;

    /// Deletes all message and dependency records.
    fn clear(&self) -> Result<()>;
}

/// Ordering used for scans: `created_at` ascending, then `priority`
/// descending, then `sequence` ascending.
pub fn reservation_order(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Sorts `messages` into reservation order and applies `limit`.
pub(crate) fn order_and_limit(messages: &mut Vec<Message>, limit: Option<usize>) {
    messages.sort_by(reservation_order);
    if let Some(limit) = limit {
        messages.truncate(limit);
    }
}
