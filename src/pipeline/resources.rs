//! Leak accounting and unexpected-error subscribers.
//!
//! Orphan detection is engine specific, so the pipeline only asks an
//! [`OrphanPolicy`] how many resources are alive. The default policy,
//! [`TrackedResources`], counts handles registered through the stage
//! context: a handle that is still alive after the test's auto-release step
//! is an orphan.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Counts live resources so leaks can be measured as a before/after delta.
pub trait OrphanPolicy: Send + Sync {
    fn live_count(&self) -> usize;
}

/// Never reports orphans.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreOrphans;

impl OrphanPolicy for IgnoreOrphans {
    fn live_count(&self) -> usize {
        0
    }
}

/// Shared counter of resources registered through [`TrackedResources::track`].
#[derive(Debug, Default, Clone)]
pub struct TrackedResources {
    live: Arc<AtomicUsize>,
}

impl TrackedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource; it counts as live until the guard is dropped.
    pub fn track(&self, name: impl Into<String>) -> TrackedResource {
        self.live.fetch_add(1, Ordering::SeqCst);
        TrackedResource {
            name: name.into(),
            live: self.live.clone(),
        }
    }
}

impl OrphanPolicy for TrackedResources {
    fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Guard for one tracked resource.
#[derive(Debug)]
pub struct TrackedResource {
    name: String,
    live: Arc<AtomicUsize>,
}

impl TrackedResource {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TrackedResource {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An error that was classified as Abort.
#[derive(Debug, Clone)]
pub struct UnexpectedError {
    /// Fully qualified name of the suite or test that raised it.
    pub source: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

type Handler = Arc<dyn Fn(&UnexpectedError) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

/// Subscriber list notified of every unexpected stage error.
///
/// Owned by the worker and handed to every loaded suite. Dropping the
/// [`Subscription`] returned by [`subscribe`](Self::subscribe) removes the
/// callback.
#[derive(Clone, Default)]
pub struct ExceptionMonitor {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl ExceptionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&UnexpectedError) + Send + Sync + 'static,
    {
        let mut id = 0;
        if let Ok(mut subs) = self.subscribers.lock() {
            id = subs.next_id;
            subs.next_id += 1;
            subs.handlers.push((id, Arc::new(handler)));
        }
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Calls every current subscriber.
    pub fn notify(&self, error: &UnexpectedError) {
        // snapshot so a handler may subscribe or unsubscribe without deadlocking
        let handlers: Vec<Handler> = match self.subscribers.lock() {
            Ok(subs) => subs.handlers.iter().map(|(_, h)| h.clone()).collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(error);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.handlers.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ExceptionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionMonitor")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Unsubscribes its callback when dropped.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade()
            && let Ok(mut subs) = subscribers.lock()
        {
            subs.handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_resources_count_live_guards() {
        let resources = TrackedResources::new();
        let a = resources.track("node");
        let b = resources.track("timer");
        assert_eq!(resources.live_count(), 2);
        assert_eq!(a.name(), "node");

        drop(a);
        assert_eq!(resources.live_count(), 1);
        drop(b);
        assert_eq!(resources.live_count(), 0);
    }

    #[test]
    fn test_ignore_orphans() {
        assert_eq!(IgnoreOrphans.live_count(), 0);
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let monitor = ExceptionMonitor::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let subscription = monitor.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(monitor.subscriber_count(), 1);

        let error = UnexpectedError {
            source: "Suite::test".to_string(),
            message: "boom".to_string(),
            stack_trace: None,
        };
        monitor.notify(&error);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(subscription);
        assert_eq!(monitor.subscriber_count(), 0);
        monitor.notify(&error);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outlives_monitor() {
        let monitor = ExceptionMonitor::new();
        let subscription = monitor.subscribe(|_| {});
        drop(monitor);
        drop(subscription);
    }
}
