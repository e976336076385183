//! Command bus boundary: [`CommandPipeline`] and its builder.
//!
//! The builder wires the three worker groups together:
//!
//! ```text
//! dispatch -> handling thread -> publication partition i -> callback reporter
//! ```
//!
//! `dispatch` only enqueues, so it is safe to call from event listeners
//! running on a publication worker.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::aggregate::Aggregate;
use crate::bus::EventBus;
use crate::callback::{CallbackReporter, CommandCallback, FutureCallback, NoOpCallback};
use crate::command::CommandMessage;
use crate::error::{BuildError, CommandError};
use crate::handling::{AggregateIdResolver, HandlingStage, Inbound, run_handling};
use crate::lock::LockingStrategy;
use crate::publication::{
    Blacklist, PublicationContext, PublicationInterceptor, PublicationWorker, RollbackConfiguration,
    run_publication,
};
use crate::registry::HandlerRegistry;
use crate::repository::EventSourcingRepository;
use crate::store::EventStore;
use crate::task::CommandResult;
use crate::transaction::TransactionManager;
use crate::unit_of_work::Resources;

/// Default number of publication partitions.
pub const DEFAULT_PUBLISHER_COUNT: usize = 2;

/// Default number of callback reporter threads.
pub const DEFAULT_REPORTER_THREADS: usize = 1;

/// Default attempt limit of [`CommandPipeline::dispatch_with_retry`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between retry attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// How [`CommandPipeline::dispatch_with_retry`] re-runs failed commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause before each retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Whether a dispatch that failed with `error` on attempt number
    /// `attempt` (1-based) should be re-run.
    pub fn should_retry(&self, attempt: u32, error: &CommandError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }
}

struct Workers {
    handling: JoinHandle<()>,
    publishers: Vec<JoinHandle<()>>,
    reporter: CallbackReporter,
}

struct Inner<A: Aggregate> {
    inbox: mpsc::UnboundedSender<Inbound<A>>,
    registry: Arc<HandlerRegistry<A>>,
    retry: RetryPolicy,
    workers: Mutex<Option<Workers>>,
}

impl<A: Aggregate> Drop for Inner<A> {
    fn drop(&mut self) {
        // Workers detach and finish the queued commands on their own.
        let _ = self.inbox.send(Inbound::Shutdown);
    }
}

/// Asynchronous command bus for aggregate type `A`.
///
/// Cheap to clone; all clones share the same workers. Call
/// [`shutdown`](CommandPipeline::shutdown) to stop and join them.
///
/// # Examples
///
/// ```no_run
/// # use eventfold_pipeline::*;
/// # async fn demo<A: Aggregate>(pipeline: CommandPipeline<A>, cmd: A::Command) {
/// let committed = pipeline
///     .dispatch_and_wait(CommandMessage::new("DoSomething", cmd))
///     .await;
/// # }
/// ```
pub struct CommandPipeline<A: Aggregate> {
    inner: Arc<Inner<A>>,
}

impl<A: Aggregate> Clone for CommandPipeline<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Aggregate> fmt::Debug for CommandPipeline<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> CommandPipeline<A> {
    /// Enqueue `command`; `callback` receives its terminal outcome.
    ///
    /// Never blocks. If the pipeline is shut down the callback is told
    /// immediately, on the calling thread, with
    /// [`CommandError::PipelineClosed`].
    pub fn dispatch(
        &self,
        command: CommandMessage<A::Command>,
        callback: impl CommandCallback<A::Command, CommandResult<A::DomainEvent>>,
    ) {
        tracing::trace!(command = %command.name(), command_id = %command.id(), "dispatching");
        let msg = Inbound::Dispatch {
            command,
            callback: Box::new(callback),
        };
        if let Err(mpsc::error::SendError(msg)) = self.inner.inbox.send(msg)
            && let Inbound::Dispatch { command, callback } = msg
        {
            callback.on_failure(&command, CommandError::PipelineClosed);
        }
    }

    /// Enqueue `command` without waiting for its outcome.
    ///
    /// Failures are logged; side effects (append, blacklist) happen all the
    /// same.
    pub fn dispatch_and_forget(&self, command: CommandMessage<A::Command>) {
        self.dispatch(command, NoOpCallback);
    }

    /// Dispatch `command` and wait for its outcome.
    ///
    /// # Returns
    ///
    /// The committed events, in sequence order.
    ///
    /// # Errors
    ///
    /// Any [`CommandError`] the command ended with.
    pub async fn dispatch_and_wait(
        &self,
        command: CommandMessage<A::Command>,
    ) -> Result<CommandResult<A::DomainEvent>, CommandError> {
        let (callback, reply) = FutureCallback::new();
        self.dispatch(command, callback);
        reply.await.map_err(|_| CommandError::PipelineClosed)?
    }

    /// Dispatch `command`, re-running the whole dispatch while it fails with
    /// a retryable error, up to the configured [`RetryPolicy`].
    ///
    /// Each attempt starts from scratch: the aggregate is loaded again and
    /// the handler invoked again.
    ///
    /// # Errors
    ///
    /// The last attempt's error, or the first non-retryable one.
    pub async fn dispatch_with_retry(
        &self,
        command: CommandMessage<A::Command>,
    ) -> Result<CommandResult<A::DomainEvent>, CommandError>
    where
        A::Command: Clone,
    {
        let policy = self.inner.retry;
        let mut attempt = 1;
        loop {
            match self.dispatch_and_wait(command.clone()).await {
                Err(error) if policy.should_retry(attempt, &error) => {
                    tracing::debug!(
                        command = %command.name(),
                        attempt,
                        error = %error,
                        "retrying command"
                    );
                    tokio::time::sleep(policy.backoff).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Route `command_name` to `handler` from now on.
    pub fn subscribe<F>(&self, command_name: impl Into<String>, handler: F)
    where
        F: Fn(
                &A,
                &CommandMessage<A::Command>,
                &Resources,
            ) -> Result<Vec<A::DomainEvent>, CommandError>
            + Send
            + Sync
            + 'static,
    {
        self.inner.registry.register(command_name, handler);
    }

    /// Stop routing `command_name`. Returns whether it had a handler.
    pub fn unsubscribe(&self, command_name: &str) -> bool {
        self.inner.registry.unregister(command_name)
    }

    /// Names of every command this pipeline can handle.
    pub fn supported_command_names(&self) -> BTreeSet<String> {
        self.inner.registry.supported_command_names()
    }

    /// Lift the quarantine of `aggregate_id` on every partition.
    ///
    /// The signal is ordered after every command dispatched before it.
    pub fn recover(&self, aggregate_id: impl Into<String>) {
        let aggregate_id = aggregate_id.into();
        if self
            .inner
            .inbox
            .send(Inbound::Recover {
                aggregate_id: aggregate_id.clone(),
            })
            .is_err()
        {
            tracing::warn!(aggregate_id = %aggregate_id, "pipeline closed, recovery ignored");
        }
    }

    /// Stop accepting commands, finish the ones already queued and join
    /// every worker thread. Later calls return immediately.
    ///
    /// Must not be called from a callback or event listener: those run on
    /// the threads being joined.
    pub fn shutdown(&self) {
        let Some(workers) = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let _ = self.inner.inbox.send(Inbound::Shutdown);

        if workers.handling.join().is_err() {
            tracing::error!("handling thread panicked");
        }
        for publisher in workers.publishers {
            if publisher.join().is_err() {
                tracing::error!("publication thread panicked");
            }
        }
        workers.reporter.join();
        tracing::info!(aggregate_type = A::AGGREGATE_TYPE, "command pipeline shut down");
    }
}

/// Builder for [`CommandPipeline`].
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use eventfold_pipeline::*;
/// # fn demo<A: Aggregate>(registry: HandlerRegistry<A>) -> Result<(), BuildError> {
/// let store = Arc::new(InMemoryEventStore::<A::DomainEvent>::new());
/// let pipeline = CommandPipelineBuilder::new(
///     store,
///     registry,
///     |cmd: &CommandMessage<A::Command>| cmd.metadata().correlation_id.clone(),
/// )
/// .publisher_count(4)
/// .locking(LockingStrategy::Optimistic)
/// .build()?;
/// # Ok(())
/// # }
/// ```
pub struct CommandPipelineBuilder<A: Aggregate> {
    store: Arc<dyn EventStore<A::DomainEvent>>,
    registry: HandlerRegistry<A>,
    resolver: Arc<dyn AggregateIdResolver<A::Command>>,
    publisher_count: usize,
    reporter_threads: usize,
    locking: LockingStrategy,
    rollback: RollbackConfiguration,
    retry: RetryPolicy,
    bus: Option<Arc<dyn EventBus<A::DomainEvent>>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    interceptors: Vec<Arc<dyn PublicationInterceptor<A>>>,
    resources: Resources,
}

impl<A: Aggregate> CommandPipelineBuilder<A> {
    /// Start a builder with default settings.
    ///
    /// # Arguments
    ///
    /// * `store` - Event store read by the repository and appended to on
    ///   commit.
    /// * `registry` - Command handlers, keyed by command name.
    /// * `resolver` - Names the aggregate each command targets.
    pub fn new(
        store: Arc<dyn EventStore<A::DomainEvent>>,
        registry: HandlerRegistry<A>,
        resolver: impl AggregateIdResolver<A::Command>,
    ) -> Self {
        Self {
            store,
            registry,
            resolver: Arc::new(resolver),
            publisher_count: DEFAULT_PUBLISHER_COUNT,
            reporter_threads: DEFAULT_REPORTER_THREADS,
            locking: LockingStrategy::default(),
            rollback: RollbackConfiguration::default(),
            retry: RetryPolicy::default(),
            bus: None,
            transactions: None,
            interceptors: Vec::new(),
            resources: Resources::new(),
        }
    }

    /// Number of publication partitions.
    pub fn publisher_count(mut self, count: usize) -> Self {
        self.publisher_count = count;
        self
    }

    /// Number of callback reporter threads.
    pub fn reporter_threads(mut self, threads: usize) -> Self {
        self.reporter_threads = threads;
        self
    }

    /// Concurrency-control strategy.
    pub fn locking(mut self, strategy: LockingStrategy) -> Self {
        self.locking = strategy;
        self
    }

    /// Which recorded failures roll the unit of work back.
    pub fn rollback_configuration(mut self, rollback: RollbackConfiguration) -> Self {
        self.rollback = rollback;
        self
    }

    /// Retry behaviour of [`CommandPipeline::dispatch_with_retry`].
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publish committed events to `bus`.
    pub fn event_bus(mut self, bus: Arc<dyn EventBus<A::DomainEvent>>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Wrap every commit attempt in a transaction from `manager`.
    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transactions = Some(manager);
        self
    }

    /// Append a publication interceptor.
    pub fn interceptor(mut self, interceptor: impl PublicationInterceptor<A>) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Make `value` available to every handler under `key`.
    pub fn resource<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.resources.insert(key, value);
        self
    }

    /// Validate the configuration and start the workers.
    ///
    /// # Errors
    ///
    /// * [`BuildError::ZeroSetting`] -- a count or the attempt limit is zero.
    /// * [`BuildError::Spawn`] -- a worker thread could not be started.
    pub fn build(self) -> Result<CommandPipeline<A>, BuildError> {
        for (setting, value) in [
            ("publisher_count", self.publisher_count),
            ("reporter_threads", self.reporter_threads),
            ("retry max_attempts", self.retry.max_attempts as usize),
        ] {
            if value == 0 {
                return Err(BuildError::ZeroSetting { setting });
            }
        }

        let locks = self.locking.build(self.publisher_count);
        let reporter = CallbackReporter::start(self.reporter_threads)?;
        let registry = Arc::new(self.registry);
        let blacklist = Arc::new(Blacklist::new(self.publisher_count));

        let ctx = Arc::new(PublicationContext {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&locks),
            bus: self.bus,
            transactions: self.transactions,
            rollback: self.rollback,
            interceptors: self.interceptors,
            blacklist: Arc::clone(&blacklist),
            reporter: reporter.sender(),
        });

        let mut partitions = Vec::with_capacity(self.publisher_count);
        let mut publishers = Vec::with_capacity(self.publisher_count);
        for partition in 0..self.publisher_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = PublicationWorker::new(partition, Arc::clone(&ctx));
            let handle = std::thread::Builder::new()
                .name(format!("publication-{partition}"))
                .spawn(move || run_publication(worker, rx))?;
            partitions.push(tx);
            publishers.push(handle);
        }
        drop(ctx);

        let stage = HandlingStage {
            registry: Arc::clone(&registry),
            resolver: self.resolver,
            repository: EventSourcingRepository::new(self.store),
            locks,
            resources: self.resources,
            partitions,
            blacklist,
            reporter: reporter.sender(),
        };
        let (inbox, rx) = mpsc::unbounded_channel();
        let handling = std::thread::Builder::new()
            .name("command-handling".into())
            .spawn(move || run_handling(stage, rx))?;

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            publishers = self.publisher_count,
            locking = ?self.locking,
            "command pipeline started"
        );

        Ok(CommandPipeline {
            inner: Arc::new(Inner {
                inbox,
                registry,
                retry: self.retry,
                workers: Mutex::new(Some(Workers {
                    handling,
                    publishers,
                    reporter,
                })),
            }),
        })
    }
}
