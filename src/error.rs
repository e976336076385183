//! Crate-level error types for command processing and event storage.

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Error reported to a command's callback when processing fails.
///
/// Every terminal failure of a [`PipelineTask`](crate::task::PipelineTask)
/// is expressed as one of these variants. The type is `Clone` so the same
/// cause can be handed to rollback hooks and to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    /// The command name has no registered handler.
    ///
    /// Reported before any unit of work is created.
    #[error("no handler found for command '{command_name}'")]
    NoHandler {
        /// Name of the command that could not be routed.
        command_name: String,
    },

    /// The aggregate id resolver could not name a target aggregate.
    #[error("could not resolve a target aggregate for command '{command_name}'")]
    AggregateIdUnresolved {
        /// Name of the command without a target.
        command_name: String,
    },

    /// A creation command targeted an aggregate that already has events.
    #[error("aggregate '{aggregate_id}' already exists")]
    AggregateAlreadyExists {
        /// Identifier of the existing aggregate.
        aggregate_id: String,
    },

    /// The repository found no events for the target aggregate.
    #[error("aggregate '{aggregate_id}' not found")]
    AggregateNotFound {
        /// Identifier that was looked up.
        aggregate_id: String,
    },

    /// The stored version advanced between load and commit.
    ///
    /// Raised by the optimistic locking strategy. Versions are the sequence
    /// number of the last applied event; `None` means "no events yet".
    #[error(
        "concurrency conflict on aggregate '{aggregate_id}': \
         expected version {expected:?}, found {actual:?}"
    )]
    ConcurrencyConflict {
        /// Aggregate whose stream moved.
        aggregate_id: String,
        /// Version observed when the aggregate was loaded.
        expected: Option<u64>,
        /// Version found in the store at commit time.
        actual: Option<u64>,
    },

    /// This task put the aggregate in quarantine.
    ///
    /// Wraps the error that made the aggregate's state suspect. Further
    /// commands are rejected with [`CommandError::AggregateCorrupted`]
    /// until a recovery signal for the aggregate is processed.
    #[error(
        "aggregate '{aggregate_id}' state corrupted; blacklisting the aggregate \
         until a recovery signal has been received"
    )]
    AggregateBlacklisted {
        /// Aggregate that was blacklisted.
        aggregate_id: String,
        /// The failure that triggered the quarantine.
        #[source]
        cause: Box<CommandError>,
    },

    /// The aggregate is quarantined and the command was rejected unseen.
    #[error(
        "aggregate '{aggregate_id}' has been blacklisted and will be ignored \
         until its state has been recovered"
    )]
    AggregateCorrupted {
        /// Quarantined aggregate.
        aggregate_id: String,
    },

    /// The pessimistic lock could not be acquired in time.
    #[error("timed out after {timeout:?} waiting for lock on aggregate '{aggregate_id}'")]
    LockTimeout {
        /// Aggregate whose lock was contended.
        aggregate_id: String,
        /// The configured wait bound.
        timeout: Duration,
    },

    /// Replay found a gapped or out-of-order event stream.
    ///
    /// Not retryable: the stored history itself is inconsistent.
    #[error(
        "event stream integrity violation on aggregate '{aggregate_id}': \
         expected sequence {expected}, found {found}"
    )]
    IntegrityViolation {
        /// Aggregate whose history is broken.
        aggregate_id: String,
        /// Sequence number the replay expected next.
        expected: u64,
        /// Sequence number actually read.
        found: u64,
    },

    /// Business error returned by a command handler.
    ///
    /// Use [`CommandError::domain_error`] to recover the concrete type.
    #[error(transparent)]
    Handler(Arc<dyn std::error::Error + Send + Sync>),

    /// A publication interceptor failed while settling the result.
    #[error("publication interceptor failed: {0}")]
    Interceptor(String),

    /// The event store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The external transaction could not be started or committed.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// A subscriber failed while events were being published.
    #[error("event bus publication failed: {0}")]
    EventBus(String),

    /// `commit` or `rollback` was called on a terminated unit of work.
    #[error("unit of work is no longer active")]
    UnitOfWorkClosed,

    /// The pipeline has been shut down and no longer accepts commands.
    #[error("command pipeline is shut down")]
    PipelineClosed,
}

impl CommandError {
    /// Wrap a domain error returned by a command handler.
    pub fn handler<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CommandError::Handler(Arc::new(err))
    }

    /// Downcast a [`CommandError::Handler`] to the concrete domain error.
    ///
    /// Returns `None` for every other variant or if the type does not match.
    pub fn domain_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            CommandError::Handler(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether re-running the whole dispatch from scratch may succeed.
    ///
    /// A bare [`CommandError::ConcurrencyConflict`] comes from
    /// [`LockManager::validate`](crate::LockManager::validate) used directly.
    /// The pipeline itself reports conflicts wrapped in
    /// [`CommandError::AggregateBlacklisted`], which is not retryable until the
    /// aggregate is recovered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommandError::LockTimeout { .. } | CommandError::ConcurrencyConflict { .. }
        )
    }

    /// Whether this failure leaves the aggregate in a suspect state.
    ///
    /// Handlers are pure, so business errors and pre-handling failures never
    /// taint an aggregate. Failures raised while settling or committing the
    /// unit of work (and broken histories) do.
    pub fn taints_aggregate(&self) -> bool {
        matches!(
            self,
            CommandError::ConcurrencyConflict { .. }
                | CommandError::IntegrityViolation { .. }
                | CommandError::Interceptor(_)
                | CommandError::Store(_)
                | CommandError::Transaction(_)
                | CommandError::EventBus(_)
        )
    }
}

/// Error returned by an [`EventStore`](crate::store::EventStore) backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// No events exist for the requested aggregate.
    #[error("aggregate '{aggregate_id}' not found")]
    AggregateNotFound {
        /// Identifier that was looked up.
        aggregate_id: String,
    },

    /// An appended event does not directly follow the stored stream.
    #[error(
        "sequence conflict on aggregate '{aggregate_id}': \
         expected sequence {expected}, got {actual}"
    )]
    SequenceConflict {
        /// Aggregate whose append was refused.
        aggregate_id: String,
        /// The next sequence number the store would accept.
        expected: u64,
        /// The sequence number that was offered.
        actual: u64,
    },

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// An event could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(Arc::new(err))
    }
}

/// Error returned by [`CommandPipelineBuilder::build`](crate::CommandPipelineBuilder::build).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A numeric setting that must be positive was zero.
    #[error("{setting} must be greater than zero")]
    ZeroSetting {
        /// Name of the offending builder setting.
        setting: &'static str,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn pipeline worker: {0}")]
    Spawn(#[from] io::Error),
}
