//! Event-sourced command pipeline with single-writer handling, partitioned
//! publication and aggregate quarantine.

mod aggregate;
pub use aggregate::Aggregate;
mod bus;
pub use bus::{EventBus, EventListener, ListenerError, SimpleEventBus, SubscriptionId};
mod callback;
pub use callback::{CommandCallback, FnCallback, FutureCallback, NoOpCallback};
mod command;
mod error;
mod event;
mod handling;
mod lock;
mod pipeline;
mod publication;
mod registry;
mod repository;
mod storage;
mod store;
mod task;
mod transaction;
mod unit_of_work;

pub use command::{CommandMessage, CommandMetadata};
pub use error::{BuildError, CommandError, StoreError};
pub use event::{DomainEventMessage, EventMetadata};
pub use handling::{AggregateIdResolver, COMMAND_ID_RESOURCE};
pub use lock::{
    DEFAULT_LOCK_TIMEOUT, LockHandle, LockManager, LockingStrategy, OptimisticLockManager,
    PessimisticLockManager,
};
pub use pipeline::{
    CommandPipeline, CommandPipelineBuilder, DEFAULT_MAX_ATTEMPTS, DEFAULT_PUBLISHER_COUNT,
    DEFAULT_REPORTER_THREADS, DEFAULT_RETRY_BACKOFF, RetryPolicy,
};
pub use publication::{InterceptorError, PublicationInterceptor, RollbackConfiguration};
pub use registry::{CommandHandler, HandlerRegistry, Registration};
pub use repository::{EventSourcingRepository, LoadedAggregate};
pub use storage::JsonlEventStore;
pub use store::{EventStore, InMemoryEventStore};
pub use task::{BoxedCallback, CommandResult, partition_for};
pub use transaction::{Transaction, TransactionManager};
pub use unit_of_work::{CommitHook, Phase, Resources, RollbackHook, UnitOfWork};
