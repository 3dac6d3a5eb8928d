//! Command-line interface definition using clap.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use courier_models::MessageState;
use courier_queue::QueueConfig;

/// Courier - persistence-backed work queue
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to state directory
    #[arg(short, long, env = "COURIER_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Pending messages examined per reservation
    #[arg(long, env = "COURIER_BATCH_SIZE", default_value_t = 1000, global = true)]
    pub batch_size: usize,

    /// Queue lock time-to-live in milliseconds
    #[arg(
        long,
        env = "COURIER_LOCK_TTL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    pub lock_ttl_ms: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a message
    Put {
        /// Routing subject
        subject: String,

        /// Message payload
        body: String,

        /// Tie-break priority among messages created at the same instant
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i64,

        /// Hold the message back for this many seconds
        #[arg(long, conflicts_with = "at")]
        delay: Option<u64>,

        /// Hold the message back until this RFC 3339 timestamp
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<DateTime<Utc>>,

        /// Message id that must finish first (repeatable)
        #[arg(long = "after", value_name = "ID")]
        after: Vec<String>,

        /// Skip if a message with the same subject and body exists
        #[arg(short, long)]
        unique: bool,
    },

    /// Reserve the next eligible message without processing it
    Reserve,

    /// Finish a reserved message
    Finish {
        /// Message id
        id: String,
    },

    /// Show a message and what it is waiting for
    Show {
        /// Message id
        id: String,
    },

    /// Process eligible messages until none remain
    Drain {
        /// Stop after this many messages
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print messages dispatched on this subject (repeatable)
        #[arg(short, long, value_name = "SUBJECT")]
        echo: Vec<String>,
    },

    /// List messages
    List {
        /// Only messages in this state
        #[arg(long, value_enum)]
        state: Option<StateFilter>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show message counts by state
    Stats,

    /// Delete every message and dependency
    Flush {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

/// Output format for list commands
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Lifecycle state accepted by `list --state`
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum StateFilter {
    Pending,
    Reserved,
    Finished,
}

impl From<StateFilter> for MessageState {
    fn from(state: StateFilter) -> Self {
        match state {
            StateFilter::Pending => MessageState::Pending,
            StateFilter::Reserved => MessageState::Reserved,
            StateFilter::Finished => MessageState::Finished,
        }
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{}': {}", value, e))
}

impl Cli {
    /// Returns the state directory path, using default if not specified.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".courier"))
                .unwrap_or_else(|| PathBuf::from(".courier"))
        })
    }

    /// Returns the log level based on verbosity.
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }

    /// Queue settings from the global flags.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_batch_size(self.batch_size)
            .with_lock_ttl(Duration::from_millis(self.lock_ttl_ms))
    }
}
