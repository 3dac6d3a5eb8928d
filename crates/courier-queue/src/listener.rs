//! Subject listeners and their registry.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use courier_models::Message;
use tracing::warn;

/// Error type returned by listeners.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A handler invoked for every processed message on a subscribed subject.
pub trait Listener: Send + Sync {
    fn handle(&self, message: &Message) -> Result<(), ListenerError>;
}

struct FnListener<F>(F);

impl<F> Listener for FnListener<F>
where
    F: Fn(&Message) -> Result<(), ListenerError> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Result<(), ListenerError> {
        (self.0)(message)
    }
}

/// Wraps a closure as a shareable [`Listener`].
pub fn listener_fn<F>(f: F) -> Arc<dyn Listener>
where
    F: Fn(&Message) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

struct Subscription {
    subject: String,
    listener: Arc<dyn Listener>,
}

/// Ordered list of (subject, listener) pairs.
///
/// Subjects match by exact string equality. Matching listeners run in
/// registration order, and the same listener may be registered for several
/// subjects. The registry lives in memory only; it is rebuilt on start.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: RwLock<Vec<Subscription>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one subscription.
    pub fn add(&self, subject: impl Into<String>, listener: Arc<dyn Listener>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                subject: subject.into(),
                listener,
            });
    }

    /// Appends many subscriptions, preserving their order.
    pub fn extend<I, S>(&self, subscriptions: I)
    where
        I: IntoIterator<Item = (S, Arc<dyn Listener>)>,
        S: Into<String>,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.extend(
            subscriptions
                .into_iter()
                .map(|(subject, listener)| Subscription {
                    subject: subject.into(),
                    listener,
                }),
        );
    }

    /// Listeners subscribed to `subject`, in registration order.
    pub fn matching(&self, subject: &str) -> Vec<Arc<dyn Listener>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.subject == subject)
            .map(|entry| entry.listener.clone())
            .collect()
    }

    /// Invokes every listener subscribed to the message's subject.
    ///
    /// A failing listener, whether it returns an error or panics, is logged
    /// and skipped; the remaining listeners still run. Returns the number of
    /// failures. No registry lock is held while listeners run.
    pub fn dispatch(&self, message: &Message) -> usize {
        let mut failures = 0;

        for (position, listener) in self.matching(&message.subject).into_iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.handle(message)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("listener panicked: {}", panic_message(&*payload)),
            };

            failures += 1;
            warn!(
                message_id = %message.id,
                subject = %message.subject,
                listener = position,
                error = %error,
                "listener failed; continuing dispatch"
            );
        }

        failures
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
