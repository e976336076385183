//! Event-sourced repository: rebuilds aggregates by replaying their streams.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::command::CommandMessage;
use crate::error::{CommandError, StoreError};
use crate::event::{DomainEventMessage, EventMetadata};
use crate::store::EventStore;

/// An aggregate state together with its identity and stream position.
#[derive(Debug, Clone)]
pub struct LoadedAggregate<A> {
    /// Aggregate identifier.
    pub id: String,
    /// Sequence number of the last applied event; `None` for an aggregate
    /// that has not been persisted yet.
    pub version: Option<u64>,
    /// State folded from every applied event.
    pub state: A,
}

impl<A: Aggregate> LoadedAggregate<A> {
    /// A not-yet-persisted aggregate starting from `A::default()`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            state: A::default(),
        }
    }

    /// Sequence number the next produced event will receive.
    pub fn next_sequence(&self) -> u64 {
        self.version.map_or(0, |v| v + 1)
    }
}

/// Loads aggregates of type `A` from an [`EventStore`].
pub struct EventSourcingRepository<A: Aggregate> {
    store: Arc<dyn EventStore<A::DomainEvent>>,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for EventSourcingRepository<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _marker: PhantomData,
        }
    }
}

impl<A: Aggregate> EventSourcingRepository<A> {
    /// Create a repository reading from `store`.
    pub fn new(store: Arc<dyn EventStore<A::DomainEvent>>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Load aggregate `id` by replaying its full stream.
    ///
    /// # Returns
    ///
    /// The folded state with `version` equal to the last applied sequence
    /// number.
    ///
    /// # Errors
    ///
    /// * [`CommandError::AggregateNotFound`] -- the stream is empty.
    /// * [`CommandError::IntegrityViolation`] -- the stream is gapped or out
    ///   of order.
    /// * [`CommandError::Store`] -- the backend failed.
    pub fn load(&self, id: &str) -> Result<LoadedAggregate<A>, CommandError> {
        let events = match self.store.read_events(id) {
            Ok(events) => events,
            Err(StoreError::AggregateNotFound { aggregate_id }) => {
                return Err(CommandError::AggregateNotFound { aggregate_id });
            }
            Err(e) => return Err(e.into()),
        };
        if events.is_empty() {
            return Err(CommandError::AggregateNotFound {
                aggregate_id: id.to_owned(),
            });
        }
        replay(id, &events)
    }

    /// Last stored sequence number of `id`, or `None` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Store`] if the backend fails.
    pub fn current_version(&self, id: &str) -> Result<Option<u64>, CommandError> {
        Ok(self.store.last_sequence_number(id)?)
    }

    /// Assign sequence numbers to freshly produced events and apply them to
    /// `aggregate`.
    ///
    /// The returned messages are ready to be buffered in a unit of work.
    ///
    /// # Arguments
    ///
    /// * `aggregate` - The loaded aggregate; its state and version advance.
    /// * `events` - Events returned by the command handler, in order.
    /// * `command` - The command that produced them, for metadata.
    pub fn stage<C>(
        &self,
        aggregate: &mut LoadedAggregate<A>,
        events: Vec<A::DomainEvent>,
        command: &CommandMessage<C>,
    ) -> Vec<DomainEventMessage<A::DomainEvent>> {
        let metadata = EventMetadata::for_command(A::AGGREGATE_TYPE, command);
        let mut staged = Vec::with_capacity(events.len());
        for payload in events {
            let seq = aggregate.next_sequence();
            aggregate.state = std::mem::take(&mut aggregate.state).apply(&payload);
            aggregate.version = Some(seq);
            staged.push(DomainEventMessage::new(
                aggregate.id.clone(),
                seq,
                payload,
                metadata.clone(),
            ));
        }
        staged
    }
}

/// Fold `events` into a fresh aggregate, enforcing contiguous sequences.
fn replay<A: Aggregate>(
    id: &str,
    events: &[DomainEventMessage<A::DomainEvent>],
) -> Result<LoadedAggregate<A>, CommandError> {
    let mut aggregate = LoadedAggregate::<A>::new(id);
    for event in events {
        let expected = aggregate.next_sequence();
        if event.sequence_number != expected {
            tracing::error!(
                aggregate_id = %id,
                expected,
                found = event.sequence_number,
                "event stream integrity violation"
            );
            return Err(CommandError::IntegrityViolation {
                aggregate_id: id.to_owned(),
                expected,
                found: event.sequence_number,
            });
        }
        aggregate.state = aggregate.state.apply(&event.payload);
        aggregate.version = Some(event.sequence_number);
    }
    Ok(aggregate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterEvent};
    use crate::store::InMemoryEventStore;

    fn seeded_store(events: Vec<CounterEvent>) -> Arc<InMemoryEventStore<CounterEvent>> {
        let store = Arc::new(InMemoryEventStore::new());
        let messages: Vec<_> = events
            .into_iter()
            .enumerate()
            .map(|(i, e)| DomainEventMessage::new("c-1", i as u64, e, EventMetadata::default()))
            .collect();
        store
            .append_events(&messages)
            .expect("seeding should succeed");
        store
    }

    #[test]
    fn load_replays_every_event() {
        let store = seeded_store(vec![
            CounterEvent::Created,
            CounterEvent::Changed { counter: 1 },
            CounterEvent::Changed { counter: 2 },
        ]);
        let repo = EventSourcingRepository::<Counter>::new(store);

        let loaded = repo.load("c-1").expect("load should succeed");
        assert_eq!(loaded.version, Some(2));
        assert_eq!(loaded.state.value, 2);
        assert!(loaded.state.created);
    }

    #[test]
    fn load_unknown_is_not_found() {
        let store = Arc::new(InMemoryEventStore::<CounterEvent>::new());
        let repo = EventSourcingRepository::<Counter>::new(store);
        let result = repo.load("ghost");
        assert!(
            matches!(result, Err(CommandError::AggregateNotFound { ref aggregate_id }) if aggregate_id == "ghost"),
            "expected AggregateNotFound, got: {result:?}"
        );
    }

    #[test]
    fn replay_detects_gap() {
        let events = vec![
            DomainEventMessage::new("c-1", 0, CounterEvent::Created, EventMetadata::default()),
            DomainEventMessage::new(
                "c-1",
                2,
                CounterEvent::Changed { counter: 2 },
                EventMetadata::default(),
            ),
        ];
        let result = replay::<Counter>("c-1", &events);
        assert!(
            matches!(
                result,
                Err(CommandError::IntegrityViolation {
                    expected: 1,
                    found: 2,
                    ..
                })
            ),
            "expected IntegrityViolation, got: {result:?}"
        );
    }

    #[test]
    fn stage_assigns_following_sequence_numbers() {
        let store = seeded_store(vec![CounterEvent::Created]);
        let repo = EventSourcingRepository::<Counter>::new(store);
        let mut loaded = repo.load("c-1").expect("load should succeed");

        let command = CommandMessage::new("ChangeCounter", ());
        let staged = repo.stage(
            &mut loaded,
            vec![
                CounterEvent::Changed { counter: 1 },
                CounterEvent::Changed { counter: 2 },
            ],
            &command,
        );

        let seqs: Vec<u64> = staged.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(loaded.version, Some(2));
        assert_eq!(loaded.state.value, 2);
        assert_eq!(staged[0].metadata.command_id, Some(command.id()));
        assert_eq!(staged[0].metadata.aggregate_type, "counter");
    }

    #[test]
    fn stage_on_new_aggregate_starts_at_zero() {
        let store = Arc::new(InMemoryEventStore::<CounterEvent>::new());
        let repo = EventSourcingRepository::<Counter>::new(store);
        let mut fresh = LoadedAggregate::<Counter>::new("c-9");

        let staged = repo.stage(
            &mut fresh,
            vec![CounterEvent::Created],
            &CommandMessage::new("CreateCounter", ()),
        );
        assert_eq!(staged[0].sequence_number, 0);
        assert_eq!(fresh.version, Some(0));
    }
}
