//! In-memory queue store.

use std::collections::HashMap;
use std::sync::RwLock;

use courier_models::{Dependency, DependencyFilter, Message, MessageFilter, MessageId};

use crate::error::{PersistenceError, Result};
use crate::store::{order_and_limit, QueueStore};

#[derive(Default)]
struct MemoryState {
    messages: HashMap<MessageId, Message>,
    dependencies: Vec<Dependency>,
    last_sequence: u64,
}

/// Non-durable store for single-process use and tests.
///
/// Uses `RwLock` so concurrent scans do not block each other.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| PersistenceError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| PersistenceError::Poisoned(e.to_string()))
    }
}

impl QueueStore for MemoryStore {
    fn insert_message(&self, mut message: Message) -> Result<Message> {
        let mut state = self.write()?;
        if state.messages.contains_key(&message.id) {
            return Err(PersistenceError::InvalidData(format!(
                "message {} already exists",
                message.id
            )));
        }

        state.last_sequence += 1;
        message.sequence = state.last_sequence;
        state.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let mut state = self.write()?;
        match state.messages.get_mut(&message.id) {
            Some(existing) => {
                *existing = message.clone();
                Ok(())
            }
            None => Err(PersistenceError::NotFound {
                kind: "message".to_string(),
                id: message.id.to_string(),
            }),
        }
    }

    fn load_message(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(self.read()?.messages.get(id).cloned())
    }

    fn scan_messages(&self, filter: &MessageFilter, limit: Option<usize>) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .read()?
            .messages
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();

        order_and_limit(&mut messages, limit);
        Ok(messages)
    }

    fn insert_dependency(&self, edge: &Dependency) -> Result<()> {
        let mut state = self.write()?;
        if !state.dependencies.contains(edge) {
            state.dependencies.push(edge.clone());
        }
        Ok(())
    }

    fn scan_dependencies(
        &self,
        filter: &DependencyFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Dependency>> {
        Ok(self
            .read()?
            .dependencies
            .iter()
            .filter(|edge| filter.matches(edge))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn delete_dependencies(&self, filter: &DependencyFilter) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.dependencies.len();
        state.dependencies.retain(|edge| !filter.matches(edge));
        Ok(before - state.dependencies.len())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        state.messages.clear();
        state.dependencies.clear();
        Ok(())
    }
}
