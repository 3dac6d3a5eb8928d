//! Courier CLI library.
//!
//! This crate provides the `courier` command-line producer, consumer, and
//! admin tool over a file-backed queue.

pub mod cli;
pub mod commands;
