//! MessageQueue - lock-serialized queue engine.
//!
//! `put` and `reserve` run under the queue mutex; `finish` does not, since a
//! message is only finished by the one consumer that reserved it.
//!
//! # Reservation order
//!
//! A reservation reads at most `batch_size` pending messages ordered by
//! `created_at` ascending, then `priority` descending, and takes the first
//! one that is due and unblocked. Priority therefore only breaks ties among
//! messages created at the same instant, and a message beyond the batch
//! cutoff is not considered even if it outranks everything in the batch.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_models::{Message, MessageFilter, MessageId, MessageState};
use courier_persistence::{FileLock, FileStore, LocalLock, LockProvider, MemoryStore, QueueStore};
use tracing::{debug, info, trace};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::graph::DependencyGraph;
use crate::listener::{listener_fn, Listener, ListenerError, ListenerRegistry};
use crate::mutex::{ExclusiveGuard, QueueMutex};

/// Arguments for [`MessageQueue::put`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub subject: String,
    pub body: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub priority: i64,
    pub dependencies: Vec<MessageId>,
    pub allow_duplicate: bool,
}

impl NewMessage {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            scheduled_for: None,
            priority: 0,
            dependencies: Vec::new(),
            allow_duplicate: true,
        }
    }

    /// Keeps the message ineligible until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Holds the message back until `preceding` has finished.
    pub fn depends_on(mut self, preceding: &MessageId) -> Self {
        self.dependencies.push(preceding.clone());
        self
    }

    /// Skips the insert if any message with the same subject and body exists.
    pub fn unique(mut self) -> Self {
        self.allow_duplicate = false;
        self
    }
}

/// Message totals by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub reserved: usize,
    pub finished: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.reserved + self.finished
    }
}

/// Outcome of [`MessageQueue::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Messages reserved, dispatched, and finished.
    pub processed: usize,
    /// Listener invocations that failed and were skipped.
    pub handler_failures: usize,
}

/// Queue operations available while holding the queue lock.
///
/// Handed to the closure passed to [`MessageQueue::run_exclusive`].
pub struct LockedQueue<'a> {
    queue: &'a MessageQueue,
    guard: &'a ExclusiveGuard<'a>,
}

impl LockedQueue<'_> {
    /// Same as [`MessageQueue::put`], without re-acquiring the lock.
    pub fn put(&self, new: NewMessage) -> Result<Option<Message>> {
        self.queue.put_locked(self.guard, new)
    }

    /// Same as [`MessageQueue::reserve`], without re-acquiring the lock.
    pub fn reserve(&self) -> Result<Option<Message>> {
        self.queue.reserve_locked(self.guard)
    }
}

/// Persistence-backed work queue.
///
/// # Example
///
/// ```no_run
/// use courier_queue::{MessageQueue, NewMessage};
///
/// let queue = MessageQueue::in_memory();
///
/// // Insert a dependent pair atomically.
/// queue
///     .run_exclusive(|q| {
///         let fetch = q.put(NewMessage::new("/feeds/fetch", "feed-1"))?.expect("duplicates allowed");
///         q.put(NewMessage::new("/feeds/parse", "feed-1").depends_on(&fetch.id))?;
///         Ok(())
///     })
///     .unwrap();
///
/// let fetch = queue.reserve().unwrap().unwrap();
/// assert!(queue.reserve().unwrap().is_none()); // parse waits for fetch
/// queue.finish(&fetch).unwrap();
/// assert_eq!(queue.reserve().unwrap().unwrap().subject, "/feeds/parse");
/// ```
pub struct MessageQueue {
    store: Arc<dyn QueueStore>,
    mutex: QueueMutex,
    graph: DependencyGraph,
    listeners: ListenerRegistry,
    config: QueueConfig,
}

impl MessageQueue {
    /// Creates a queue over the given store and lock provider.
    pub fn new(
        store: Arc<dyn QueueStore>,
        locks: Arc<dyn LockProvider>,
        config: QueueConfig,
    ) -> Self {
        let mutex = QueueMutex::new(
            locks,
            config.lock_key.clone(),
            config.lock_ttl,
            config.lock_backoff,
        );
        Self {
            graph: DependencyGraph::new(store.clone()),
            store,
            mutex,
            listeners: ListenerRegistry::new(),
            config,
        }
    }

    /// Opens a file-backed queue rooted at `state_dir`, with lock files in
    /// `state_dir/locks`.
    pub fn open(state_dir: impl AsRef<Path>, config: QueueConfig) -> Self {
        let state_dir = state_dir.as_ref();
        Self::new(
            Arc::new(FileStore::new(state_dir)),
            Arc::new(FileLock::new(state_dir.join("locks"))),
            config,
        )
    }

    /// Creates a non-durable single-process queue.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalLock::new()),
            QueueConfig::default(),
        )
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Runs `work` under the queue lock.
    ///
    /// Use this to insert a group of interdependent messages atomically. The
    /// lock is released exactly once, even if `work` fails or panics. Every
    /// write made through the handle first confirms the lease, so work that
    /// outlives the lock TTL fails with `LockLost` instead of racing a new
    /// holder.
    pub fn run_exclusive<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&LockedQueue<'_>) -> Result<T>,
    {
        self.mutex
            .run_exclusive(|guard| work(&LockedQueue { queue: self, guard }))
    }

    /// Adds a message to the queue.
    ///
    /// Returns `Ok(None)` when `allow_duplicate` is off and a message with the
    /// same signature already exists, in any state.
    ///
    /// Every dependency must name an existing message. Dependencies that
    /// have already finished are ignored. Dependency edges are written only
    /// after the message itself has been stored, and an edge whose preceding
    /// message finished concurrently is removed again.
    pub fn put(&self, new: NewMessage) -> Result<Option<Message>> {
        self.run_exclusive(|q| q.put(new))
    }

    /// Reserves the next eligible message.
    ///
    /// Returns `Ok(None)` if nothing is eligible right now.
    pub fn reserve(&self) -> Result<Option<Message>> {
        self.run_exclusive(|q| q.reserve())
    }

    fn put_locked(&self, guard: &ExclusiveGuard<'_>, new: NewMessage) -> Result<Option<Message>> {
        let NewMessage {
            subject,
            body,
            scheduled_for,
            priority,
            dependencies,
            allow_duplicate,
        } = new;

        let mut message = Message::new(subject, body);
        message.scheduled_for = scheduled_for;
        message.priority = priority;

        if !allow_duplicate {
            let filter = MessageFilter::new().with_signature(message.signature.clone());
            if !self.store.scan_messages(&filter, Some(1))?.is_empty() {
                debug!(
                    subject = %message.subject,
                    signature = %message.signature,
                    "duplicate message suppressed"
                );
                return Ok(None);
            }
        }

        // Validate before writing anything, so a bad dependency leaves no trace.
        let mut preceding = Vec::with_capacity(dependencies.len());
        for id in dependencies {
            match self.store.load_message(&id)? {
                None => return Err(QueueError::UnknownDependency(id.to_string())),
                Some(dep) if dep.is_finished() => {
                    trace!(dependency = %id, "dependency already finished, no edge needed");
                }
                Some(_) => {
                    if !preceding.contains(&id) {
                        preceding.push(id);
                    }
                }
            }
        }

        guard.renew()?;
        let message = self.store.insert_message(message)?;
        for id in &preceding {
            self.graph.add(id, &message.id)?;

            // `finish` runs outside the lock. If it resolved this predecessor
            // before the edge existed, nothing else will delete the edge.
            if self.store.load_message(id)?.is_some_and(|dep| dep.is_finished()) {
                trace!(dependency = %id, "dependency finished during put, dropping edge");
                self.graph.remove(id, &message.id)?;
            }
        }

        info!(
            message_id = %message.id,
            subject = %message.subject,
            priority = message.priority,
            dependencies = preceding.len(),
            "message queued"
        );
        Ok(Some(message))
    }

    fn reserve_locked(&self, guard: &ExclusiveGuard<'_>) -> Result<Option<Message>> {
        let now = Utc::now();
        let candidates = self
            .store
            .scan_messages(&MessageFilter::pending(), Some(self.config.batch_size))?;

        for candidate in candidates {
            guard.keep_alive()?;

            if candidate.is_scheduled_after(now) {
                trace!(message_id = %candidate.id, "not due yet");
                continue;
            }
            if self.graph.has_unfinished_dependency(&candidate)? {
                trace!(message_id = %candidate.id, "blocked by dependency");
                continue;
            }

            guard.renew()?;
            // Re-read under the confirmed lease; the scan may be stale.
            let Some(mut current) = self.store.load_message(&candidate.id)? else {
                continue;
            };
            if !current.mark_reserved(now) {
                debug!(message_id = %current.id, "reserved by another consumer, skipping");
                continue;
            }
            self.store.update_message(&current)?;
            debug!(message_id = %current.id, subject = %current.subject, "message reserved");
            return Ok(Some(current));
        }

        Ok(None)
    }

    /// Marks a reserved message finished and unblocks its dependents.
    ///
    /// The record is re-read from the store, so a stale copy is fine. Fails
    /// with `InvalidState` if the message is not reserved or already
    /// finished.
    pub fn finish(&self, message: &Message) -> Result<Message> {
        let mut current = self
            .store
            .load_message(&message.id)?
            .ok_or_else(|| QueueError::NotFound(message.id.to_string()))?;

        if !current.mark_finished(Utc::now()) {
            return Err(QueueError::InvalidState(format!(
                "cannot finish message in {} state",
                current.state()
            )));
        }
        self.store.update_message(&current)?;

        let unblocked = self.graph.resolve(&current.id)?;
        debug!(message_id = %current.id, unblocked, "message finished");
        Ok(current)
    }

    /// Deletes every message and dependency edge.
    pub fn flush_all(&self) -> Result<()> {
        self.store.clear()?;
        info!("queue flushed");
        Ok(())
    }

    /// Subscribes `listener` to messages with exactly this subject.
    pub fn add_listener(&self, subject: impl Into<String>, listener: impl Listener + 'static) {
        self.listeners.add(subject, Arc::new(listener));
    }

    /// Subscribes a closure to messages with exactly this subject.
    pub fn add_listener_fn<F>(&self, subject: impl Into<String>, f: F)
    where
        F: Fn(&Message) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners.add(subject, listener_fn(f));
    }

    /// Subscribes several listeners, preserving order.
    pub fn add_listeners<I, S>(&self, subscriptions: I)
    where
        I: IntoIterator<Item = (S, Arc<dyn Listener>)>,
        S: Into<String>,
    {
        self.listeners.extend(subscriptions);
    }

    /// Reserves one message, dispatches it to every matching listener, and
    /// finishes it.
    ///
    /// Returns `Ok(None)` without doing anything if no message is eligible.
    /// Listener failures are logged and do not prevent the finish.
    pub fn process(&self) -> Result<Option<Message>> {
        Ok(self.process_one()?.map(|(message, _)| message))
    }

    fn process_one(&self) -> Result<Option<(Message, usize)>> {
        let Some(message) = self.reserve()? else {
            return Ok(None);
        };

        let failures = self.listeners.dispatch(&message);
        let finished = self.finish(&message)?;
        Ok(Some((finished, failures)))
    }

    /// Processes messages until none is eligible or `limit` is reached.
    ///
    /// Messages unblocked by earlier finishes in the same drain are picked
    /// up too.
    pub fn drain(&self, limit: Option<usize>) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();

        while limit.map_or(true, |max| summary.processed < max) {
            match self.process_one()? {
                Some((_, failures)) => {
                    summary.processed += 1;
                    summary.handler_failures += failures;
                }
                None => break,
            }
        }

        info!(
            processed = summary.processed,
            handler_failures = summary.handler_failures,
            "drain complete"
        );
        Ok(summary)
    }

    /// Loads a message by id.
    pub fn get(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(self.store.load_message(id)?)
    }

    /// Lists messages matching `filter` in reservation order.
    pub fn list(&self, filter: &MessageFilter, limit: Option<usize>) -> Result<Vec<Message>> {
        Ok(self.store.scan_messages(filter, limit)?)
    }

    /// Counts messages by state.
    pub fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for message in self.store.scan_messages(&MessageFilter::new(), None)? {
            match message.state() {
                MessageState::Pending => counts.pending += 1,
                MessageState::Reserved => counts.reserved += 1,
                MessageState::Finished => counts.finished += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_put_and_reserve() {
        let queue = MessageQueue::in_memory();

        let put = queue.put(NewMessage::new("/tests", "body")).unwrap().unwrap();
        let reserved = queue.reserve().unwrap().unwrap();

        assert_eq!(reserved.id, put.id);
        assert_eq!(reserved.state(), MessageState::Reserved);
        assert!(queue.reserve().unwrap().is_none());
    }

    #[test]
    fn test_reserve_empty() {
        let queue = MessageQueue::in_memory();
        assert!(queue.reserve().unwrap().is_none());
        assert!(queue.process().unwrap().is_none());
    }

    #[test]
    fn test_priority_breaks_ties_only() {
        let queue = MessageQueue::in_memory();
        let now = Utc::now();

        // Same creation instant: priority decides.
        let low = queue.put(NewMessage::new("s", "low")).unwrap().unwrap();
        let high = queue.put(NewMessage::new("s", "high").priority(5)).unwrap().unwrap();
        for id in [&low.id, &high.id] {
            let mut m = queue.get(id).unwrap().unwrap();
            m.created_at = now;
            queue.store.update_message(&m).unwrap();
        }

        // Created earlier: wins despite lowest priority.
        let early = queue.put(NewMessage::new("s", "early").priority(-10)).unwrap().unwrap();
        let mut m = queue.get(&early.id).unwrap().unwrap();
        m.created_at = now - Duration::seconds(1);
        queue.store.update_message(&m).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.reserve().unwrap())
            .map(|m| m.body)
            .collect();
        assert_eq!(order, vec!["early", "high", "low"]);
    }

    #[test]
    fn test_batch_cutoff_limits_search() {
        let queue = MessageQueue::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalLock::new()),
            QueueConfig::default().with_batch_size(2),
        );

        let first = queue.put(NewMessage::new("s", "first")).unwrap().unwrap();
        for body in ["second", "third"] {
            queue
                .put(NewMessage::new("s", body).depends_on(&first.id))
                .unwrap();
        }
        queue.put(NewMessage::new("s", "free")).unwrap();

        assert_eq!(queue.reserve().unwrap().unwrap().body, "first");
        // Both blocked messages fill the batch, hiding "free".
        assert!(queue.reserve().unwrap().is_none());

        assert_eq!(
            queue.list(&MessageFilter::pending(), None).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_unknown_dependency_rejected_without_insert() {
        let queue = MessageQueue::in_memory();

        let result = queue.put(NewMessage::new("s", "b").depends_on(&MessageId::from("msg-missing")));

        assert!(matches!(result, Err(QueueError::UnknownDependency(_))));
        assert_eq!(queue.counts().unwrap().total(), 0);
    }

    #[test]
    fn test_finished_dependency_creates_no_edge() {
        let queue = MessageQueue::in_memory();

        queue.put(NewMessage::new("s", "done")).unwrap();
        let done = queue.reserve().unwrap().unwrap();
        queue.finish(&done).unwrap();

        let later = queue
            .put(NewMessage::new("s", "later").depends_on(&done.id))
            .unwrap()
            .unwrap();
        assert!(queue.graph().blockers(&later.id).unwrap().is_empty());
        assert_eq!(queue.reserve().unwrap().unwrap().id, later.id);
    }

    /// Finishes a chosen message just before the next edge write, the way a
    /// consumer outside the lock can.
    struct FinishBeforeEdge {
        inner: MemoryStore,
        target: std::sync::Mutex<Option<MessageId>>,
    }

    impl QueueStore for FinishBeforeEdge {
        fn insert_message(&self, message: Message) -> courier_persistence::Result<Message> {
            self.inner.insert_message(message)
        }

        fn update_message(&self, message: &Message) -> courier_persistence::Result<()> {
            self.inner.update_message(message)
        }

        fn load_message(&self, id: &MessageId) -> courier_persistence::Result<Option<Message>> {
            self.inner.load_message(id)
        }

        fn scan_messages(
            &self,
            filter: &MessageFilter,
            limit: Option<usize>,
        ) -> courier_persistence::Result<Vec<Message>> {
            self.inner.scan_messages(filter, limit)
        }

        fn insert_dependency(&self, edge: &courier_models::Dependency) -> courier_persistence::Result<()> {
            if let Some(id) = self.target.lock().unwrap().take() {
                let mut preceding = self.inner.load_message(&id)?.unwrap();
                assert!(preceding.mark_finished(Utc::now()));
                self.inner.update_message(&preceding)?;
                self.inner
                    .delete_dependencies(&courier_models::DependencyFilter::preceding(&id))?;
            }
            self.inner.insert_dependency(edge)
        }

        fn scan_dependencies(
            &self,
            filter: &courier_models::DependencyFilter,
            limit: Option<usize>,
        ) -> courier_persistence::Result<Vec<courier_models::Dependency>> {
            self.inner.scan_dependencies(filter, limit)
        }

        fn delete_dependencies(
            &self,
            filter: &courier_models::DependencyFilter,
        ) -> courier_persistence::Result<usize> {
            self.inner.delete_dependencies(filter)
        }

        fn clear(&self) -> courier_persistence::Result<()> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_dependency_finished_during_put_leaves_no_edge() {
        let store = Arc::new(FinishBeforeEdge {
            inner: MemoryStore::new(),
            target: std::sync::Mutex::new(None),
        });
        let queue = MessageQueue::new(store.clone(), Arc::new(LocalLock::new()), QueueConfig::default());

        queue.put(NewMessage::new("s", "first")).unwrap();
        let first = queue.reserve().unwrap().unwrap();

        *store.target.lock().unwrap() = Some(first.id.clone());
        let second = queue
            .put(NewMessage::new("s", "second").depends_on(&first.id))
            .unwrap()
            .unwrap();

        assert!(queue.get(&first.id).unwrap().unwrap().is_finished());
        assert!(queue.graph().blockers(&second.id).unwrap().is_empty());
        assert_eq!(queue.reserve().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn test_finish_requires_reservation() {
        let queue = MessageQueue::in_memory();
        let message = queue.put(NewMessage::new("s", "b")).unwrap().unwrap();

        let result = queue.finish(&message);
        assert!(matches!(result, Err(QueueError::InvalidState(_))));
    }

    #[test]
    fn test_finish_twice_rejected() {
        let queue = MessageQueue::in_memory();
        queue.put(NewMessage::new("s", "b")).unwrap();

        let reserved = queue.reserve().unwrap().unwrap();
        let finished = queue.finish(&reserved).unwrap();
        let first_finish = finished.finished_at;

        assert!(matches!(queue.finish(&reserved), Err(QueueError::InvalidState(_))));
        assert_eq!(queue.get(&reserved.id).unwrap().unwrap().finished_at, first_finish);
    }

    #[test]
    fn test_finish_unknown_message() {
        let queue = MessageQueue::in_memory();
        let result = queue.finish(&Message::new("s", "b"));
        assert!(matches!(result, Err(QueueError::NotFound(_))));
    }

    #[test]
    fn test_run_exclusive_group_insert() {
        let queue = MessageQueue::in_memory();

        let ids = queue
            .run_exclusive(|q| {
                let a = q.put(NewMessage::new("s", "a"))?.unwrap();
                let b = q.put(NewMessage::new("s", "b").depends_on(&a.id))?.unwrap();
                Ok((a.id, b.id))
            })
            .unwrap();

        assert_eq!(queue.graph().blockers(&ids.1).unwrap(), vec![ids.0.clone()]);
        // Lock was released.
        assert_eq!(queue.reserve().unwrap().unwrap().id, ids.0);
    }

    #[test]
    fn test_run_exclusive_propagates_error() {
        let queue = MessageQueue::in_memory();

        let result: Result<()> = queue.run_exclusive(|q| {
            q.put(NewMessage::new("s", "kept"))?;
            Err(QueueError::InvalidState("abort".to_string()))
        });

        assert!(matches!(result, Err(QueueError::InvalidState(_))));
        // Work done before the failure stays, and the lock is free again.
        assert_eq!(queue.reserve().unwrap().unwrap().body, "kept");
    }

    #[test]
    fn test_process_counts_handler_failures() {
        let queue = MessageQueue::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        queue.add_listener_fn("/s", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Err("nope".into())
        });

        queue.put(NewMessage::new("/s", "1")).unwrap();
        queue.put(NewMessage::new("/s", "2")).unwrap();

        let summary = queue.drain(None).unwrap();
        assert_eq!(
            summary,
            DrainSummary {
                processed: 2,
                handler_failures: 2
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.counts().unwrap().finished, 2);
    }

    #[test]
    fn test_drain_respects_limit() {
        let queue = MessageQueue::in_memory();
        for i in 0..5 {
            queue.put(NewMessage::new("s", i.to_string())).unwrap();
        }

        assert_eq!(queue.drain(Some(3)).unwrap().processed, 3);
        assert_eq!(
            queue.counts().unwrap(),
            QueueCounts {
                pending: 2,
                reserved: 0,
                finished: 3
            }
        );
    }

    #[test]
    fn test_flush_all() {
        let queue = MessageQueue::in_memory();
        let a = queue.put(NewMessage::new("s", "a")).unwrap().unwrap();
        queue.put(NewMessage::new("s", "b").depends_on(&a.id)).unwrap();

        queue.flush_all().unwrap();

        assert_eq!(queue.counts().unwrap().total(), 0);
        assert!(queue.reserve().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_reservations_are_disjoint() {
        let queue = Arc::new(MessageQueue::in_memory());
        for i in 0..40 {
            queue.put(NewMessage::new("s", format!("m{}", i))).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = queue.clone();
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(m) = q.reserve().unwrap() {
                        mine.push(m.id);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<MessageId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 40);
    }
}
