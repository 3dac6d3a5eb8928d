//! Persistence layer for Courier.
//!
//! This crate provides the durable side of the queue:
//! - [`QueueStore`]: message and dependency-edge records, with a crash-safe
//!   file backend ([`FileStore`]) and an in-memory backend ([`MemoryStore`])
//! - [`LockProvider`]: acquire-if-absent keys with a time-to-live, backed by
//!   lock files ([`FileLock`]) or an in-process table ([`LocalLock`])
//!
//! # Example
//!
//! ```no_run
//! use courier_persistence::{FileStore, QueueStore};
//! use courier_models::{Message, MessageFilter};
//!
//! let store = FileStore::new("/home/user/.courier");
//!
//! let stored = store.insert_message(Message::new("/feeds/poll", "https://example.com/rss")).unwrap();
//! let pending = store.scan_messages(&MessageFilter::pending(), Some(10)).unwrap();
//! assert_eq!(pending[0].id, stored.id);
//! ```

pub mod atomic;
pub mod error;
pub mod file_store;
pub mod lock;
pub mod memory_store;
pub mod store;

pub use error::{PersistenceError, Result};
pub use file_store::FileStore;
pub use lock::{FileLock, LocalLock, LockProvider};
pub use memory_store::MemoryStore;
pub use store::QueueStore;
