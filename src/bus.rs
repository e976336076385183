//! Event bus boundary and a synchronous in-process implementation.

use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::CommandError;
use crate::event::DomainEventMessage;

/// Boxed error returned by listeners.
pub type ListenerError = Box<dyn Error + Send + Sync>;

/// Delivers committed events to subscribers.
///
/// Called by the publication stage as part of committing a unit of work,
/// after the store append and before the external transaction commits.
pub trait EventBus<E>: Send + Sync + 'static {
    /// Publish `events` in order.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::EventBus`] if delivery fails; the unit of work
    /// is then rolled back.
    fn publish(&self, events: &[DomainEventMessage<E>]) -> Result<(), CommandError>;
}

/// A subscriber of a [`SimpleEventBus`].
pub trait EventListener<E>: Send + Sync + 'static {
    /// React to one published event.
    ///
    /// # Errors
    ///
    /// A failure aborts publication of the remaining events and fails the
    /// command that produced them.
    fn on_event(&self, event: &DomainEventMessage<E>) -> Result<(), ListenerError>;
}

impl<E, F> EventListener<E> for F
where
    F: Fn(&DomainEventMessage<E>) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    fn on_event(&self, event: &DomainEventMessage<E>) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Identifies a subscription so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event bus that calls every listener synchronously on the publishing
/// thread, in subscription order.
///
/// Listeners may dispatch new commands: dispatch only enqueues, so it never
/// blocks the publishing worker.
pub struct SimpleEventBus<E> {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn EventListener<E>>)>>,
    next_id: AtomicU64,
}

impl<E> Default for SimpleEventBus<E> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<E> std::fmt::Debug for SimpleEventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<E> SimpleEventBus<E> {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; it receives every event published afterwards.
    pub fn subscribe(&self, listener: impl EventListener<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of current listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<E: Send + Sync + 'static> EventBus<E> for SimpleEventBus<E> {
    fn publish(&self, events: &[DomainEventMessage<E>]) -> Result<(), CommandError> {
        // Snapshot so listeners can (un)subscribe while being called.
        let listeners: Vec<Arc<dyn EventListener<E>>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for event in events {
            for listener in &listeners {
                listener.on_event(event).map_err(|e| {
                    tracing::error!(
                        aggregate_id = %event.aggregate_id,
                        sequence_number = event.sequence_number,
                        error = %e,
                        "event listener failed"
                    );
                    CommandError::EventBus(e.to_string())
                })?;
            }
        }
        Ok(())
    }
}
