//! Lock-serialized work queue with dependency gating for Courier.
//!
//! This crate provides the `MessageQueue` engine:
//! - Every store-mutating sequence (`put`, `reserve`) runs under a single
//!   named lock ([`QueueMutex`]) backed by a [`LockProvider`](courier_persistence::LockProvider)
//! - Reservation is first-fit over a bounded batch ordered by creation time,
//!   then priority
//! - Messages wait for every preceding message to finish ([`DependencyGraph`])
//! - Reserved messages are dispatched to listeners by exact subject match
//!
//! # Example
//!
//! ```no_run
//! use courier_queue::{MessageQueue, NewMessage, QueueConfig};
//!
//! let queue = MessageQueue::open("/tmp/courier", QueueConfig::default());
//!
//! queue.add_listener_fn("/feeds/poll", |message| {
//!     println!("polling {}", message.body);
//!     Ok(())
//! });
//!
//! queue.put(NewMessage::new("/feeds/poll", "https://example.com/rss")).unwrap();
//!
//! // Drain everything that is currently eligible.
//! while let Some(message) = queue.process().unwrap() {
//!     println!("done: {}", message.id);
//! }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod listener;
pub mod mutex;
pub mod queue;

pub use config::{QueueConfig, MIN_LOCK_TTL};
pub use error::{QueueError, Result};
pub use graph::DependencyGraph;
pub use listener::{listener_fn, Listener, ListenerError, ListenerRegistry};
pub use mutex::{ExclusiveGuard, QueueMutex};
pub use queue::{DrainSummary, LockedQueue, MessageQueue, NewMessage, QueueCounts};
