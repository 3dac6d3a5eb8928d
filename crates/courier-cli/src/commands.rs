//! Command handlers for CLI subcommands.

use chrono::{DateTime, Duration, Utc};
use courier_models::{Message, MessageFilter, MessageId};
use courier_queue::{MessageQueue, NewMessage};
use tracing::{info, warn};

use crate::cli::{Commands, OutputFormat, StateFilter};

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Execute a CLI command against `queue`.
pub fn execute(command: Commands, queue: &MessageQueue) -> Result<()> {
    match command {
        Commands::Put {
            subject,
            body,
            priority,
            delay,
            at,
            after,
            unique,
        } => {
            let scheduled_for = match (delay, at) {
                (Some(secs), _) => Some(delay_until(Utc::now(), secs)?),
                (None, at) => at,
            };
            let mut new = NewMessage::new(subject, body).priority(priority);
            if let Some(at) = scheduled_for {
                new = new.scheduled_for(at);
            }
            for id in &after {
                new = new.depends_on(&MessageId::from(id.as_str()));
            }
            if unique {
                new = new.unique();
            }
            cmd_put(queue, new)
        }
        Commands::Reserve => cmd_reserve(queue),
        Commands::Finish { id } => cmd_finish(queue, &MessageId::from(id)),
        Commands::Show { id } => cmd_show(queue, &MessageId::from(id)),
        Commands::Drain { limit, echo } => cmd_drain(queue, limit, &echo),
        Commands::List { state, format } => cmd_list(queue, state, format),
        Commands::Stats => cmd_stats(queue),
        Commands::Flush { yes } => cmd_flush(queue, yes),
    }
}

fn cmd_put(queue: &MessageQueue, new: NewMessage) -> Result<()> {
    match queue.put(new)? {
        Some(message) => {
            println!("Queued message {}", message.id);
            if let Some(at) = message.scheduled_for {
                println!("  Scheduled for: {}", format_time(Some(at)));
            }
            let blockers = queue.graph().blockers(&message.id)?;
            if !blockers.is_empty() {
                println!("  Waiting for: {}", join_ids(&blockers));
            }
        }
        None => println!("Duplicate message suppressed."),
    }
    Ok(())
}

fn cmd_reserve(queue: &MessageQueue) -> Result<()> {
    match queue.reserve()? {
        Some(message) => {
            println!("Reserved message {}", message.id);
            println!("  Subject: {}", message.subject);
            println!("  Body: {}", message.body);
        }
        None => println!("No eligible message."),
    }
    Ok(())
}

fn cmd_finish(queue: &MessageQueue, id: &MessageId) -> Result<()> {
    let message = queue
        .get(id)?
        .ok_or_else(|| format!("Message not found: {}", id))?;

    let finished = queue.finish(&message)?;
    println!(
        "Finished message {} at {}",
        finished.id,
        format_time(finished.finished_at)
    );
    Ok(())
}

fn cmd_show(queue: &MessageQueue, id: &MessageId) -> Result<()> {
    let message = queue
        .get(id)?
        .ok_or_else(|| format!("Message not found: {}", id))?;

    println!("Message: {}", message.id);
    println!("  State: {}", message.state());
    println!("  Subject: {}", message.subject);
    println!("  Body: {}", message.body);
    println!("  Priority: {}", message.priority);
    println!("  Signature: {}", message.signature);
    println!("  Created: {}", format_time(Some(message.created_at)));
    println!("  Scheduled: {}", format_time(message.scheduled_for));
    println!("  Reserved: {}", format_time(message.reserved_at));
    println!("  Finished: {}", format_time(message.finished_at));

    let blockers = queue.graph().blockers(&message.id)?;
    if !blockers.is_empty() {
        println!("  Waiting for: {}", join_ids(&blockers));
    }
    Ok(())
}

fn cmd_drain(queue: &MessageQueue, limit: Option<usize>, echo: &[String]) -> Result<()> {
    for subject in echo {
        queue.add_listener_fn(subject.as_str(), |message: &Message| {
            println!("[{}] {} {}", message.subject, message.id, message.body);
            Ok(())
        });
    }

    let summary = queue.drain(limit)?;
    info!(processed = summary.processed, "drain finished");

    println!("Processed {} message(s)", summary.processed);
    if summary.handler_failures > 0 {
        warn!(failures = summary.handler_failures, "listener failures during drain");
        println!("  {} listener failure(s)", summary.handler_failures);
    }
    Ok(())
}

fn cmd_list(queue: &MessageQueue, state: Option<StateFilter>, format: OutputFormat) -> Result<()> {
    let mut filter = MessageFilter::new();
    if let Some(state) = state {
        filter = filter.with_state(state.into());
    }
    let messages = queue.list(&filter, None)?;

    match format {
        OutputFormat::Table => {
            if messages.is_empty() {
                println!("No messages found.");
                return Ok(());
            }

            println!(
                "{:<40}  {:<9}  {:>8}  {:<24}  BODY",
                "ID", "STATE", "PRIORITY", "SUBJECT"
            );
            println!("{}", "-".repeat(100));
            for message in &messages {
                println!(
                    "{:<40}  {:<9}  {:>8}  {:<24}  {}",
                    message.id,
                    message.state().to_string(),
                    message.priority,
                    truncate(&message.subject, 24),
                    truncate(&message.body, 30)
                );
            }
            println!("\n{} message(s)", messages.len());
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&messages)?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn cmd_stats(queue: &MessageQueue) -> Result<()> {
    let counts = queue.counts()?;
    println!("Pending:  {}", counts.pending);
    println!("Reserved: {}", counts.reserved);
    println!("Finished: {}", counts.finished);
    println!("Total:    {}", counts.total());
    Ok(())
}

fn cmd_flush(queue: &MessageQueue, yes: bool) -> Result<()> {
    if !yes {
        return Err("Refusing to flush without --yes".into());
    }
    queue.flush_all()?;
    println!("Queue flushed.");
    Ok(())
}

/// `now` plus `secs` seconds, rejecting delays chrono cannot represent.
fn delay_until(now: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| format!("Delay of {} seconds is out of range", secs).into())
}

fn format_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn join_ids(ids: &[MessageId]) -> String {
    ids.iter()
        .map(MessageId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Truncate a string to max length with ellipsis.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_models::MessageState;
    use courier_queue::QueueConfig;
    use tempfile::tempdir;

    fn put(subject: &str, body: &str) -> Commands {
        Commands::Put {
            subject: subject.to_string(),
            body: body.to_string(),
            priority: 0,
            delay: None,
            at: None,
            after: Vec::new(),
            unique: false,
        }
    }

    #[test]
    fn test_put_then_drain() {
        let dir = tempdir().unwrap();
        let queue = MessageQueue::open(dir.path(), QueueConfig::default());

        execute(put("/a", "one"), &queue).unwrap();
        execute(put("/a", "two"), &queue).unwrap();
        execute(
            Commands::Drain {
                limit: None,
                echo: vec!["/a".to_string()],
            },
            &queue,
        )
        .unwrap();

        assert_eq!(queue.counts().unwrap().finished, 2);
    }

    #[test]
    fn test_put_after_and_delay() {
        let queue = MessageQueue::in_memory();
        execute(put("/a", "first"), &queue).unwrap();
        let first = queue.list(&MessageFilter::new(), None).unwrap().remove(0);

        execute(
            Commands::Put {
                subject: "/a".to_string(),
                body: "second".to_string(),
                priority: 2,
                delay: Some(3600),
                at: None,
                after: vec![first.id.to_string()],
                unique: false,
            },
            &queue,
        )
        .unwrap();

        let second = queue
            .list(&MessageFilter::new(), None)
            .unwrap()
            .into_iter()
            .find(|m| m.body == "second")
            .unwrap();
        assert_eq!(second.priority, 2);
        assert!(second.scheduled_for.unwrap() > Utc::now());
        assert_eq!(queue.graph().blockers(&second.id).unwrap(), vec![first.id]);
    }

    #[test]
    fn test_put_unknown_dependency_fails() {
        let queue = MessageQueue::in_memory();
        let mut command = put("/a", "x");
        if let Commands::Put { after, .. } = &mut command {
            after.push("msg-missing".to_string());
        }
        assert!(execute(command, &queue).is_err());
    }

    #[test]
    fn test_reserve_and_finish_by_id() {
        let queue = MessageQueue::in_memory();
        execute(put("/a", "x"), &queue).unwrap();
        execute(Commands::Reserve, &queue).unwrap();

        let reserved = queue
            .list(&MessageFilter::new().with_state(MessageState::Reserved), None)
            .unwrap()
            .remove(0);
        execute(
            Commands::Finish {
                id: reserved.id.to_string(),
            },
            &queue,
        )
        .unwrap();

        assert_eq!(
            queue.get(&reserved.id).unwrap().unwrap().state(),
            MessageState::Finished
        );
        // Finishing again is an error.
        assert!(execute(
            Commands::Finish {
                id: reserved.id.to_string()
            },
            &queue
        )
        .is_err());
    }

    #[test]
    fn test_show_missing_message() {
        let queue = MessageQueue::in_memory();
        let result = execute(
            Commands::Show {
                id: "msg-nope".to_string(),
            },
            &queue,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_list_and_stats() {
        let queue = MessageQueue::in_memory();
        execute(put("/a", "x"), &queue).unwrap();

        for format in [OutputFormat::Table, OutputFormat::Json] {
            execute(
                Commands::List {
                    state: Some(StateFilter::Pending),
                    format,
                },
                &queue,
            )
            .unwrap();
        }
        execute(Commands::Stats, &queue).unwrap();
    }

    #[test]
    fn test_flush_requires_confirmation() {
        let queue = MessageQueue::in_memory();
        execute(put("/a", "x"), &queue).unwrap();

        assert!(execute(Commands::Flush { yes: false }, &queue).is_err());
        assert_eq!(queue.counts().unwrap().total(), 1);

        execute(Commands::Flush { yes: true }, &queue).unwrap();
        assert_eq!(queue.counts().unwrap().total(), 0);
    }

    #[test]
    fn test_delay_until() {
        let now = Utc::now();
        assert_eq!(delay_until(now, 90).unwrap(), now + Duration::seconds(90));

        assert!(delay_until(now, u64::MAX).is_err());
        assert!(delay_until(now, 10_000_000_000_000_000).is_err());
        assert!(delay_until(now, i64::MAX as u64).is_err());
    }

    #[test]
    fn test_put_with_oversized_delay_fails() {
        let queue = MessageQueue::in_memory();
        let mut command = put("/a", "x");
        if let Commands::Put { delay, .. } = &mut command {
            *delay = Some(u64::MAX);
        }

        assert!(execute(command, &queue).is_err());
        assert_eq!(queue.counts().unwrap().total(), 0);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer subject", 10), "a much ...");
    }
}
