//! Self-contained example: two counters driven through a command pipeline
//! backed by the JSONL event store, with an event bus subscriber keeping a
//! cross-instance read model.
//!
//! Run with: `cargo run --example counter`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use eventfold_pipeline::{
    Aggregate, CommandMessage, CommandMetadata, CommandPipelineBuilder, DomainEventMessage,
    EventStore, HandlerRegistry, JsonlEventStore, ListenerError, LockingStrategy, SimpleEventBus,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Counter aggregate
// ---------------------------------------------------------------------------

/// A simple counter that can be incremented, decremented, or reset.
#[derive(Debug, Clone, Default)]
struct Counter {
    value: i64,
}

/// Commands accepted by the [`Counter`] aggregate. Each names its target.
#[derive(Debug, Clone)]
enum CounterCommand {
    Open { id: String },
    Increment { id: String },
    Decrement { id: String },
    Reset { id: String },
}

impl CounterCommand {
    fn target(&self) -> &str {
        match self {
            CounterCommand::Open { id }
            | CounterCommand::Increment { id }
            | CounterCommand::Decrement { id }
            | CounterCommand::Reset { id } => id,
        }
    }
}

/// Domain events produced by the [`Counter`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum CounterEvent {
    Opened,
    Incremented,
    Decremented,
    WasReset { previous: i64 },
}

/// Errors that can occur when handling a [`CounterCommand`].
#[derive(Debug, thiserror::Error)]
enum CounterError {
    #[error("counter is already zero, cannot decrement")]
    AlreadyZero,
    #[error("counter is already zero, nothing to reset")]
    NothingToReset,
}

impl Aggregate for Counter {
    const AGGREGATE_TYPE: &'static str = "counter";
    type Command = CounterCommand;
    type DomainEvent = CounterEvent;
    type Error = CounterError;

    fn handle(&self, cmd: &CounterCommand) -> Result<Vec<CounterEvent>, CounterError> {
        match cmd {
            CounterCommand::Open { .. } => Ok(vec![CounterEvent::Opened]),
            CounterCommand::Increment { .. } => Ok(vec![CounterEvent::Incremented]),
            CounterCommand::Decrement { .. } => {
                if self.value <= 0 {
                    return Err(CounterError::AlreadyZero);
                }
                Ok(vec![CounterEvent::Decremented])
            }
            CounterCommand::Reset { .. } => {
                if self.value == 0 {
                    return Err(CounterError::NothingToReset);
                }
                Ok(vec![CounterEvent::WasReset {
                    previous: self.value,
                }])
            }
        }
    }

    fn apply(mut self, event: &CounterEvent) -> Self {
        match event {
            CounterEvent::Opened => {}
            CounterEvent::Incremented => self.value += 1,
            CounterEvent::Decremented => self.value -= 1,
            CounterEvent::WasReset { .. } => self.value = 0,
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Totals read model, fed by the event bus
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Totals {
    increments: AtomicU64,
    decrements: AtomicU64,
    resets: AtomicU64,
}

impl Totals {
    fn observe(&self, event: &DomainEventMessage<CounterEvent>) {
        let slot = match event.payload {
            CounterEvent::Incremented => &self.increments,
            CounterEvent::Decremented => &self.decrements,
            CounterEvent::WasReset { .. } => &self.resets,
            CounterEvent::Opened => return,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn command(name: &str, payload: CounterCommand) -> CommandMessage<CounterCommand> {
    CommandMessage::new(name, payload)
        .with_metadata(CommandMetadata::default().with_actor("example-runner"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(JsonlEventStore::<CounterEvent>::new(tmp.path()));

    let totals = Arc::new(Totals::default());
    let bus = Arc::new(SimpleEventBus::<CounterEvent>::new());
    let observer = Arc::clone(&totals);
    bus.subscribe(
        move |event: &DomainEventMessage<CounterEvent>| -> Result<(), ListenerError> {
            observer.observe(event);
            Ok(())
        },
    );

    let registry = HandlerRegistry::<Counter>::new()
        .with_aggregate_creation("Open")
        .with_aggregate_handler("Increment")
        .with_aggregate_handler("Decrement")
        .with_aggregate_handler("Reset");

    let pipeline = CommandPipelineBuilder::new(
        store.clone(),
        registry,
        |cmd: &CommandMessage<CounterCommand>| Some(cmd.payload().target().to_owned()),
    )
    .publisher_count(2)
    .locking(LockingStrategy::default())
    .event_bus(bus)
    .build()?;

    for id in ["alpha", "beta"] {
        pipeline
            .dispatch_and_wait(command("Open", CounterCommand::Open { id: id.into() }))
            .await?;
    }

    for _ in 0..3 {
        pipeline
            .dispatch_and_wait(command(
                "Increment",
                CounterCommand::Increment { id: "alpha".into() },
            ))
            .await?;
    }
    for (name, payload) in [
        ("Increment", CounterCommand::Increment { id: "beta".into() }),
        ("Decrement", CounterCommand::Decrement { id: "beta".into() }),
        ("Increment", CounterCommand::Increment { id: "beta".into() }),
    ] {
        pipeline.dispatch_and_wait(command(name, payload)).await?;
    }

    let reset = pipeline
        .dispatch_and_wait(command("Reset", CounterCommand::Reset { id: "alpha".into() }))
        .await?;
    println!("alpha reset at sequence {}", reset[0].sequence_number);

    // A rejected command leaves the aggregate usable.
    let rejected = pipeline
        .dispatch_and_wait(command(
            "Decrement",
            CounterCommand::Decrement { id: "alpha".into() },
        ))
        .await;
    println!("decrementing alpha: {rejected:?}");
    assert!(rejected.is_err());

    pipeline.shutdown();

    let fold = |id: &str| -> Result<Counter, Box<dyn std::error::Error>> {
        let events = store.read_events(id)?;
        Ok(events
            .iter()
            .fold(Counter::default(), |state, event| state.apply(&event.payload)))
    };
    let alpha = fold("alpha")?;
    let beta = fold("beta")?;

    println!("alpha = {}", alpha.value);
    println!("beta  = {}", beta.value);
    println!("streams on disk: {:?}", store.list_streams()?);
    println!(
        "totals: increments={}, decrements={}, resets={}",
        totals.increments.load(Ordering::Relaxed),
        totals.decrements.load(Ordering::Relaxed),
        totals.resets.load(Ordering::Relaxed),
    );

    assert_eq!(alpha.value, 0, "alpha should be reset to 0");
    assert_eq!(beta.value, 1, "beta should be 1 (inc, dec, inc)");
    assert_eq!(totals.increments.load(Ordering::Relaxed), 5);
    assert_eq!(totals.decrements.load(Ordering::Relaxed), 1);
    assert_eq!(totals.resets.load(Ordering::Relaxed), 1);

    println!("all assertions passed");

    Ok(())
}
