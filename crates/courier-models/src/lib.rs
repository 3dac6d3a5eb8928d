//! Core data models for Courier.
//!
//! This crate provides the record types shared by the store and the queue
//! engine: messages, dependency edges, and the filters used to scan them.

pub mod dependency;
pub mod filter;
pub mod ids;
pub mod message;

pub use dependency::Dependency;
pub use filter::{DependencyFilter, MessageFilter};
pub use ids::MessageId;
pub use message::{signature, Message, MessageState};
