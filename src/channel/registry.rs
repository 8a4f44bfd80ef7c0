//! Typed subscriber registry for decoded channel events.
//!
//! Dispatch iterates an `Arc` snapshot of the subscriber list, so listeners may subscribe or
//! unsubscribe while an event is being delivered without deadlocking or skipping peers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use super::event::{Event, EventKind};

/// Callback invoked synchronously, in receipt order, for each matching event.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(EventKind),
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kind(k) => *k == kind,
            EventFilter::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        EventFilter::Kind(kind)
    }
}

#[derive(Clone)]
struct Entry {
    id: u64,
    filter: EventFilter,
    listener: Listener,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    entries: Mutex<Arc<Vec<Entry>>>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, Arc<Vec<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) -> bool {
        let mut guard = self.entries();
        if !guard.iter().any(|e| e.id == id) {
            return false;
        }
        let next: Vec<Entry> = guard.iter().filter(|e| e.id != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }
}

/// Shared registry; clones refer to the same subscriber set.
#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<Inner>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events matching `filter`. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub fn subscribe(&self, filter: impl Into<EventFilter>, listener: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let filter = filter.into();
        let mut guard = self.inner.entries();
        let mut next: Vec<Entry> = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(Entry {
            id,
            filter,
            listener,
        });
        *guard = Arc::new(next);
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Forward matching events into an unbounded queue, preserving receipt order.
    pub fn subscribe_queue(
        &self,
        filter: impl Into<EventFilter>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        (self.subscribe(filter, listener), rx)
    }

    /// Deliver `event` to every matching subscriber registered at call time.
    pub fn dispatch(&self, event: &Event) -> usize {
        let snapshot: Arc<Vec<Entry>> = self.inner.entries().clone();
        let kind = event.kind();
        let mut delivered = 0;
        for entry in snapshot.iter().filter(|e| e.filter.matches(kind)) {
            (entry.listener)(event);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for one registration.
pub struct Subscription {
    id: u64,
    registry: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unsubscribe now. Returns false if already gone.
    pub fn cancel(self) -> bool {
        self.remove()
    }

    fn remove(&self) -> bool {
        self.registry
            .upgrade()
            .map(|inner| inner.remove(self.id))
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (
            hits,
            Arc::new(move |_: &Event| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn dispatch_respects_filters() {
        let registry = EventRegistry::new();
        let (all_hits, all) = counter();
        let (auth_hits, auth) = counter();
        let _a = registry.subscribe(EventFilter::All, all);
        let _b = registry.subscribe(EventKind::Authenticated, auth);

        registry.dispatch(&Event::Authenticated);
        registry.dispatch(&Event::Unknown { name: "x".into() });

        assert_eq!(all_hits.load(Ordering::SeqCst), 2);
        assert_eq!(auth_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let registry = EventRegistry::new();
        let (hits, listener) = counter();
        let sub = registry.subscribe(EventFilter::All, listener);
        assert_eq!(registry.len(), 1);
        drop(sub);
        assert!(registry.is_empty());
        registry.dispatch(&Event::Authenticated);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listeners_may_subscribe_during_dispatch() {
        let registry = EventRegistry::new();
        let spawned: Arc<Mutex<Vec<Subscription>>> = Arc::default();
        let reg = registry.clone();
        let keep = Arc::clone(&spawned);
        let _outer = registry.subscribe(
            EventFilter::All,
            Arc::new(move |_: &Event| {
                let sub = reg.subscribe(EventFilter::All, Arc::new(|_: &Event| {}));
                keep.lock().unwrap().push(sub);
            }),
        );

        // The new subscriber is not part of the in-flight snapshot.
        assert_eq!(registry.dispatch(&Event::Authenticated), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.dispatch(&Event::Authenticated), 2);
    }

    #[test]
    fn listener_may_cancel_itself() {
        let registry = EventRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();
        let inner = Arc::clone(&slot);
        let sub = registry.subscribe(
            EventFilter::All,
            Arc::new(move |_: &Event| {
                inner.lock().unwrap().take();
            }),
        );
        *slot.lock().unwrap() = Some(sub);
        registry.dispatch(&Event::Authenticated);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn queue_preserves_order() {
        let registry = EventRegistry::new();
        let (_sub, mut rx) = registry.subscribe_queue(EventFilter::All);
        for name in ["a", "b", "c"] {
            registry.dispatch(&Event::Unknown { name: name.into() });
        }
        for name in ["a", "b", "c"] {
            assert_eq!(rx.recv().await, Some(Event::Unknown { name: name.into() }));
        }
    }
}
