//! Precedence edges between messages.
//!
//! The graph is never traversed. An edge exists exactly as long as its
//! preceding message is unfinished: finishing a message deletes every edge
//! it precedes. So "has any incoming edge" is the whole blocked test, and a
//! dependent becomes eligible the moment its last edge is removed.

use std::sync::Arc;

use courier_models::{Dependency, DependencyFilter, Message, MessageId};
use courier_persistence::QueueStore;

use crate::error::Result;

/// Store-backed view over dependency edges.
#[derive(Clone)]
pub struct DependencyGraph {
    store: Arc<dyn QueueStore>,
}

impl DependencyGraph {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Records that `dependent` must wait for `preceding` to finish.
    pub fn add(&self, preceding: &MessageId, dependent: &MessageId) -> Result<()> {
        self.store
            .insert_dependency(&Dependency::new(preceding.clone(), dependent.clone()))?;
        Ok(())
    }

    /// Deletes the single edge from `preceding` to `dependent`, if present.
    pub fn remove(&self, preceding: &MessageId, dependent: &MessageId) -> Result<()> {
        self.store
            .delete_dependencies(&DependencyFilter::between(preceding, dependent))?;
        Ok(())
    }

    /// Returns true if at least one edge still points at `message`.
    pub fn has_unfinished_dependency(&self, message: &Message) -> Result<bool> {
        let edges = self
            .store
            .scan_dependencies(&DependencyFilter::dependent(&message.id), Some(1))?;
        Ok(!edges.is_empty())
    }

    /// Returns the messages `id` is still waiting for.
    pub fn blockers(&self, id: &MessageId) -> Result<Vec<MessageId>> {
        Ok(self
            .store
            .scan_dependencies(&DependencyFilter::dependent(id), None)?
            .into_iter()
            .map(|edge| edge.preceding)
            .collect())
    }

    /// Removes every edge preceded by `id`, returning how many were removed.
    pub fn resolve(&self, id: &MessageId) -> Result<usize> {
        Ok(self.store.delete_dependencies(&DependencyFilter::preceding(id))?)
    }
}
