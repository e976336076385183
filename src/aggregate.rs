//! Aggregate trait: pure decision and evolution functions.

use serde::{Serialize, de::DeserializeOwned};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. State is
/// built by folding domain events through [`apply`](Aggregate::apply), and
/// new events are decided by [`handle`](Aggregate::handle). Neither function
/// holds a reference back to the pipeline: the handling stage owns buffering
/// of whatever `handle` returns.
///
/// # Associated Types
///
/// - `Command`: the payload type of commands this aggregate accepts.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. It validates a command against the current state and
///   returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, total function. Replaying a
///   stream through it must reproduce exactly the state reached live.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "order"). Used in event metadata
    /// and as a directory name by the file-backed store.
    const AGGREGATE_TYPE: &'static str;

    /// The payload of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}
