//! Event store abstraction and the in-memory backend.
//!
//! An [`EventStore`] is an append-only, per-aggregate ordered log. Appends
//! are all-or-nothing: either every event of the call is stored or none is.
//! Every backend refuses appends whose sequence numbers do not directly
//! continue the stored stream, so gaps and duplicates cannot be written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::error::StoreError;
use crate::event::DomainEventMessage;

/// Append-only per-aggregate event log.
///
/// # Type Parameters
///
/// * `E` - The domain event payload type.
pub trait EventStore<E>: Send + Sync + 'static {
    /// Append `events` atomically, in order.
    ///
    /// Events may belong to several aggregates; within each aggregate they
    /// must continue that aggregate's stream without gaps.
    ///
    /// # Errors
    ///
    /// * [`StoreError::SequenceConflict`] -- an event does not directly
    ///   follow the stored stream. Nothing is appended.
    /// * [`StoreError::Io`] / [`StoreError::Serialization`] -- backend failure.
    fn append_events(&self, events: &[DomainEventMessage<E>]) -> Result<(), StoreError>;

    /// Read the events of `aggregate_id` with sequence numbers in
    /// `first..=last`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AggregateNotFound`] if the aggregate has no
    /// events at all.
    fn read_events_range(
        &self,
        aggregate_id: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<DomainEventMessage<E>>, StoreError>;

    /// Sequence number of the last stored event, or `None` for an unknown
    /// aggregate.
    fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<u64>, StoreError>;

    /// Read the full stream of `aggregate_id` from sequence 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AggregateNotFound`] if the aggregate has no
    /// events.
    fn read_events(&self, aggregate_id: &str) -> Result<Vec<DomainEventMessage<E>>, StoreError> {
        self.read_events_range(aggregate_id, 0, u64::MAX)
    }
}

/// Verify that `events` continue the stored streams without gaps.
///
/// `last_stored` reports the last stored sequence number of an aggregate.
/// It is consulted once per aggregate; later events of the same aggregate are
/// checked against the running position within `events`.
pub(crate) fn check_continuity<E, F>(
    events: &[DomainEventMessage<E>],
    mut last_stored: F,
) -> Result<(), StoreError>
where
    F: FnMut(&str) -> Result<Option<u64>, StoreError>,
{
    let mut next: HashMap<&str, u64> = HashMap::new();
    for event in events {
        let expected = match next.get(event.aggregate_id.as_str()) {
            Some(seq) => *seq,
            None => last_stored(&event.aggregate_id)?.map_or(0, |seq| seq + 1),
        };
        if event.sequence_number != expected {
            return Err(StoreError::SequenceConflict {
                aggregate_id: event.aggregate_id.clone(),
                expected,
                actual: event.sequence_number,
            });
        }
        next.insert(event.aggregate_id.as_str(), expected + 1);
    }
    Ok(())
}

/// Volatile [`EventStore`] keeping every stream in a `HashMap`.
///
/// Suitable for tests and single-process deployments that rebuild state on
/// start. Counts `append_events` calls so tests can verify how many units
/// of work actually reached the store.
#[derive(Debug)]
pub struct InMemoryEventStore<E> {
    streams: RwLock<HashMap<String, Vec<DomainEventMessage<E>>>>,
    appends: AtomicUsize,
}

impl<E> Default for InMemoryEventStore<E> {
    fn default() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            appends: AtomicUsize::new(0),
        }
    }
}

impl<E> InMemoryEventStore<E> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `append_events` calls so far.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Number of events stored for `aggregate_id`.
    pub fn stream_len(&self, aggregate_id: &str) -> usize {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams.get(aggregate_id).map_or(0, Vec::len)
    }
}

impl<E> EventStore<E> for InMemoryEventStore<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn append_events(&self, events: &[DomainEventMessage<E>]) -> Result<(), StoreError> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        check_continuity(events, |id| {
            Ok(streams
                .get(id)
                .and_then(|stream| stream.last())
                .map(|e| e.sequence_number))
        })?;

        for event in events {
            streams
                .entry(event.aggregate_id.clone())
                .or_default()
                .push(event.clone());
        }
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_events_range(
        &self,
        aggregate_id: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<DomainEventMessage<E>>, StoreError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let stream = streams
            .get(aggregate_id)
            .ok_or_else(|| StoreError::AggregateNotFound {
                aggregate_id: aggregate_id.to_owned(),
            })?;
        Ok(stream
            .iter()
            .filter(|e| (first..=last).contains(&e.sequence_number))
            .cloned()
            .collect())
    }

    fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<u64>, StoreError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(aggregate_id)
            .and_then(|stream| stream.last())
            .map(|e| e.sequence_number))
    }
}
