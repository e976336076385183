//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use eventfold_pipeline::{
    Aggregate, CommandMessage, CommandPipelineBuilder, DomainEventMessage, EventMetadata,
    EventStore, HandlerRegistry, InMemoryEventStore, StoreError,
};
use serde::{Deserialize, Serialize};

/// A counter that must be created before it can change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counter {
    pub created: bool,
    pub value: u64,
}

#[derive(Debug, Clone)]
pub enum CounterCommand {
    Create { id: String },
    Change { id: String, counter: u64 },
    Increment { id: String },
    Fail { id: String },
}

impl CounterCommand {
    pub fn target(&self) -> &str {
        match self {
            CounterCommand::Create { id }
            | CounterCommand::Change { id, .. }
            | CounterCommand::Increment { id }
            | CounterCommand::Fail { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CounterEvent {
    Created,
    Changed { counter: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("counter already exists")]
    AlreadyCreated,
    #[error("counter has not been created")]
    NotCreated,
    #[error("requested failure")]
    Requested,
}

impl Aggregate for Counter {
    const AGGREGATE_TYPE: &'static str = "counter";

    type Command = CounterCommand;
    type DomainEvent = CounterEvent;
    type Error = CounterError;

    fn handle(&self, cmd: &CounterCommand) -> Result<Vec<CounterEvent>, CounterError> {
        match cmd {
            CounterCommand::Create { .. } if self.created => Err(CounterError::AlreadyCreated),
            CounterCommand::Create { .. } => Ok(vec![CounterEvent::Created]),
            _ if !self.created => Err(CounterError::NotCreated),
            CounterCommand::Change { counter, .. } => {
                Ok(vec![CounterEvent::Changed { counter: *counter }])
            }
            CounterCommand::Increment { .. } => Ok(vec![CounterEvent::Changed {
                counter: self.value + 1,
            }]),
            CounterCommand::Fail { .. } => Err(CounterError::Requested),
        }
    }

    fn apply(mut self, event: &CounterEvent) -> Self {
        match event {
            CounterEvent::Created => self.created = true,
            CounterEvent::Changed { counter } => self.value = *counter,
        }
        self
    }
}

pub fn create(id: &str) -> CommandMessage<CounterCommand> {
    CommandMessage::new("CreateCounter", CounterCommand::Create { id: id.into() })
}

pub fn change(id: &str, counter: u64) -> CommandMessage<CounterCommand> {
    CommandMessage::new(
        "ChangeCounter",
        CounterCommand::Change {
            id: id.into(),
            counter,
        },
    )
}

pub fn increment(id: &str) -> CommandMessage<CounterCommand> {
    CommandMessage::new("Increment", CounterCommand::Increment { id: id.into() })
}

pub fn fail(id: &str) -> CommandMessage<CounterCommand> {
    CommandMessage::new("Fail", CounterCommand::Fail { id: id.into() })
}

/// Registry routing every fixture command to `Aggregate::handle`.
pub fn registry() -> HandlerRegistry<Counter> {
    HandlerRegistry::new()
        .with_aggregate_creation("CreateCounter")
        .with_aggregate_handler("ChangeCounter")
        .with_aggregate_handler("Increment")
        .with_aggregate_handler("Fail")
}

pub fn builder(store: Arc<dyn EventStore<CounterEvent>>) -> CommandPipelineBuilder<Counter> {
    builder_with(store, registry())
}

pub fn builder_with(
    store: Arc<dyn EventStore<CounterEvent>>,
    registry: HandlerRegistry<Counter>,
) -> CommandPipelineBuilder<Counter> {
    CommandPipelineBuilder::new(store, registry, |cmd: &CommandMessage<CounterCommand>| {
        Some(cmd.payload().target().to_owned())
    })
}

/// Store holding `id` created at sequence 0.
pub fn seeded_store(id: &str) -> Arc<InMemoryEventStore<CounterEvent>> {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append_events(&[DomainEventMessage::new(
            id,
            0,
            CounterEvent::Created,
            EventMetadata::default(),
        )])
        .expect("seed append should succeed");
    store
}

/// Replay `id`'s stored stream into a fresh aggregate.
pub fn replay(store: &dyn EventStore<CounterEvent>, id: &str) -> Counter {
    store
        .read_events(id)
        .expect("stream should exist")
        .iter()
        .fold(Counter::default(), |state, event| state.apply(&event.payload))
}

/// A latch that blocks until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().expect("gate lock") = true;
        self.opened.notify_all();
    }

    pub fn wait(&self) {
        let guard = self.open.lock().expect("gate lock");
        let (_guard, timeout) = self
            .opened
            .wait_timeout_while(guard, Duration::from_secs(10), |open| !*open)
            .expect("gate lock");
        assert!(!timeout.timed_out(), "gate was never opened");
    }
}

/// Store whose appends wait for a [`Gate`]; reads pass straight through.
///
/// With `failing` set, appends fail once the gate opens.
pub struct GatedStore {
    pub inner: InMemoryEventStore<CounterEvent>,
    pub gate: Gate,
    pub failing: Mutex<bool>,
}

impl GatedStore {
    pub fn new(inner: InMemoryEventStore<CounterEvent>) -> Self {
        Self {
            inner,
            gate: Gate::default(),
            failing: Mutex::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("flag lock") = failing;
    }
}

impl EventStore<CounterEvent> for GatedStore {
    fn append_events(&self, events: &[DomainEventMessage<CounterEvent>]) -> Result<(), StoreError> {
        self.gate.wait();
        if *self.failing.lock().expect("flag lock") {
            return Err(std::io::Error::other("disk down").into());
        }
        self.inner.append_events(events)
    }

    fn read_events_range(
        &self,
        aggregate_id: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<DomainEventMessage<CounterEvent>>, StoreError> {
        self.inner.read_events_range(aggregate_id, first, last)
    }

    fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<u64>, StoreError> {
        self.inner.last_sequence_number(aggregate_id)
    }
}

/// Store whose appends fail while `failing` is set.
pub struct FlakyStore {
    pub inner: InMemoryEventStore<CounterEvent>,
    pub failing: Mutex<bool>,
}

impl FlakyStore {
    pub fn new(inner: InMemoryEventStore<CounterEvent>) -> Self {
        Self {
            inner,
            failing: Mutex::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("flag lock") = failing;
    }
}

impl EventStore<CounterEvent> for FlakyStore {
    fn append_events(&self, events: &[DomainEventMessage<CounterEvent>]) -> Result<(), StoreError> {
        if *self.failing.lock().expect("flag lock") {
            return Err(std::io::Error::other("disk unavailable").into());
        }
        self.inner.append_events(events)
    }

    fn read_events_range(
        &self,
        aggregate_id: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<DomainEventMessage<CounterEvent>>, StoreError> {
        self.inner.read_events_range(aggregate_id, first, last)
    }

    fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<u64>, StoreError> {
        self.inner.last_sequence_number(aggregate_id)
    }
}
