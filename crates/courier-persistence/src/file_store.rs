//! File-backed queue store.

use std::fs;
use std::path::{Path, PathBuf};

use courier_models::{Dependency, DependencyFilter, Message, MessageFilter, MessageId};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::atomic::{atomic_write_json, read_json_optional, remove_if_exists};
use crate::error::{PersistenceError, Result};
use crate::store::{order_and_limit, QueueStore};

/// Stores records as individual JSON files:
///
/// ```text
/// base_path/
/// ├── messages/
/// │   ├── msg-abc123.json
/// │   └── msg-def456.json
/// ├── dependencies/
/// │   └── msg-def456/          (dependent)
/// │       └── msg-abc123.json  (preceding)
/// └── sequence
/// ```
///
/// Edges are grouped by dependent so the blocked check for one message
/// lists a single small directory. Edge files are selected by path before
/// any JSON is parsed.
///
/// Every record write is atomic (temp file + rename). Multi-record
/// sequences are not; callers serialize them with a lock.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Creates a new FileStore rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn messages_dir(&self) -> PathBuf {
        self.base_path.join("messages")
    }

    fn dependencies_dir(&self) -> PathBuf {
        self.base_path.join("dependencies")
    }

    fn sequence_path(&self) -> PathBuf {
        self.base_path.join("sequence")
    }

    fn message_path(&self, id: &MessageId) -> PathBuf {
        self.messages_dir().join(format!("{}.json", id))
    }

    fn dependent_dir(&self, dependent: &MessageId) -> PathBuf {
        self.dependencies_dir().join(dependent.as_str())
    }

    fn dependency_path(&self, edge: &Dependency) -> PathBuf {
        self.dependent_dir(&edge.dependent)
            .join(format!("{}.json", edge.preceding))
    }

    /// Bumps and returns the persisted insertion counter.
    fn next_sequence(&self) -> Result<u64> {
        let path = self.sequence_path();
        let next = read_json_optional::<u64>(&path)?.unwrap_or(0) + 1;
        atomic_write_json(&path, &next)?;
        Ok(next)
    }

    /// Lists the entries of `dir`; a missing directory is empty.
    fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::ReadError {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        entries
            .map(|entry| {
                entry
                    .map(|e| e.path())
                    .map_err(|source| PersistenceError::ReadError {
                        path: dir.to_path_buf(),
                        source,
                    })
            })
            .collect()
    }

    fn is_record(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "json")
    }

    /// Reads a record, logging and skipping one that cannot be parsed.
    fn read_record<T: DeserializeOwned>(path: &Path) -> Option<T> {
        // A record may vanish between listing and reading.
        match read_json_optional::<T>(path) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable record");
                None
            }
        }
    }

    /// Paths of the edge files `filter` can match, without reading them.
    fn edge_paths(&self, filter: &DependencyFilter) -> Result<Vec<PathBuf>> {
        let dirs = match &filter.dependent {
            Some(dependent) => vec![self.dependent_dir(dependent)],
            None => Self::list_dir(&self.dependencies_dir())?
                .into_iter()
                .filter(|path| path.is_dir())
                .collect(),
        };

        let mut paths = Vec::new();
        for dir in dirs {
            match &filter.preceding {
                Some(preceding) => {
                    let path = dir.join(format!("{}.json", preceding));
                    if path.exists() {
                        paths.push(path);
                    }
                }
                None => paths.extend(Self::list_dir(&dir)?.into_iter().filter(|p| Self::is_record(p))),
            }
        }
        Ok(paths)
    }
}

impl QueueStore for FileStore {
    fn insert_message(&self, mut message: Message) -> Result<Message> {
        let path = self.message_path(&message.id);
        if path.exists() {
            return Err(PersistenceError::InvalidData(format!(
                "message {} already exists",
                message.id
            )));
        }

        message.sequence = self.next_sequence()?;
        atomic_write_json(&path, &message)?;
        debug!(message_id = %message.id, sequence = message.sequence, "message inserted");
        Ok(message)
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let path = self.message_path(&message.id);
        if !path.exists() {
            return Err(PersistenceError::NotFound {
                kind: "message".to_string(),
                id: message.id.to_string(),
            });
        }
        atomic_write_json(&path, message)
    }

    fn load_message(&self, id: &MessageId) -> Result<Option<Message>> {
        read_json_optional(&self.message_path(id))
    }

    fn scan_messages(&self, filter: &MessageFilter, limit: Option<usize>) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = Self::list_dir(&self.messages_dir())?
            .iter()
            .filter(|path| Self::is_record(path))
            .filter_map(|path| Self::read_record::<Message>(path))
            .filter(|message| filter.matches(message))
            .collect();

        order_and_limit(&mut messages, limit);
        Ok(messages)
    }

    fn insert_dependency(&self, edge: &Dependency) -> Result<()> {
        atomic_write_json(&self.dependency_path(edge), edge)
    }

    fn scan_dependencies(
        &self,
        filter: &DependencyFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Dependency>> {
        let edges = self
            .edge_paths(filter)?
            .iter()
            .filter_map(|path| Self::read_record::<Dependency>(path))
            .filter(|edge| filter.matches(edge))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(edges)
    }

    fn delete_dependencies(&self, filter: &DependencyFilter) -> Result<usize> {
        let mut removed = 0;
        for path in self.edge_paths(filter)? {
            if remove_if_exists(&path)? {
                removed += 1;
            }
            // Drop the dependent's directory once empty; fails harmlessly if not.
            if let Some(dir) = path.parent() {
                let _ = fs::remove_dir(dir);
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<()> {
        for dir in [self.messages_dir(), self.dependencies_dir()] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(PersistenceError::WriteError { path: dir, source }),
            }
        }
        Ok(())
    }
}
