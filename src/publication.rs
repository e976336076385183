//! The publication stage: partitioned workers that settle every task.
//!
//! Each worker owns one partition of the aggregate-id hash space and is
//! the only writer of the matching [`Blacklist`] segment. A task moves
//! through
//!
//! ```text
//! Pending -> { Recovering | Rejected | Finalizing } -> { Committed | RolledBack }
//! ```
//!
//! and the worker releases its lock and schedules the callback report once
//! it is terminal.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::aggregate::Aggregate;
use crate::bus::EventBus;
use crate::callback::ReportSender;
use crate::command::CommandMessage;
use crate::error::CommandError;
use crate::event::DomainEventMessage;
use crate::lock::LockManager;
use crate::store::EventStore;
use crate::task::{CommandTask, PipelineTask, TaskKind, partition_for};
use crate::transaction::{Transaction, TransactionManager};

/// Boxed error returned by a [`PublicationInterceptor`].
pub type InterceptorError = Box<dyn Error + Send + Sync>;

/// Post-processing run on every task before it is committed or rolled back.
///
/// Interceptors run in registration order. The first one to fail turns a
/// successful task into a failed one with [`CommandError::Interceptor`]; a
/// task that already failed keeps its original error.
pub trait PublicationInterceptor<A: Aggregate>: Send + Sync + 'static {
    /// Inspect the settled handling outcome.
    ///
    /// # Arguments
    ///
    /// * `command` - The dispatched command.
    /// * `events` - Events buffered for publication (empty on failure).
    /// * `error` - Failure recorded so far, if any.
    fn intercept(
        &self,
        command: &CommandMessage<A::Command>,
        events: &[DomainEventMessage<A::DomainEvent>],
        error: Option<&CommandError>,
    ) -> Result<(), InterceptorError>;
}

/// Decides which failures roll the unit of work back.
///
/// A failure that does not roll back still goes through a commit attempt,
/// which persists whatever events were buffered.
#[derive(Clone, Default)]
pub enum RollbackConfiguration {
    /// Every failure rolls back.
    #[default]
    AllErrors,
    /// Only failures that leave the aggregate suspect roll back.
    TaintingErrors,
    /// Never roll back because of a recorded failure.
    Never,
    /// Custom predicate over the failure.
    Custom(Arc<dyn Fn(&CommandError) -> bool + Send + Sync>),
}

impl fmt::Debug for RollbackConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackConfiguration::AllErrors => f.write_str("AllErrors"),
            RollbackConfiguration::TaintingErrors => f.write_str("TaintingErrors"),
            RollbackConfiguration::Never => f.write_str("Never"),
            RollbackConfiguration::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl RollbackConfiguration {
    /// Whether `error` requires the unit of work to be rolled back.
    pub fn rolls_back_on(&self, error: &CommandError) -> bool {
        match self {
            RollbackConfiguration::AllErrors => true,
            RollbackConfiguration::TaintingErrors => error.taints_aggregate(),
            RollbackConfiguration::Never => false,
            RollbackConfiguration::Custom(predicate) => predicate(error),
        }
    }
}

/// Terminal state reached by one task on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// A recovery signal was applied to this partition's blacklist.
    Recovered,
    /// The task belongs to another partition.
    Skipped,
    /// Events were appended and published.
    Committed,
    /// The unit of work was rolled back.
    RolledBack,
}

/// Quarantined aggregate ids, segmented by the publication hash.
///
/// Segment `i` is written only by publication worker `i`. The handling
/// stage reads it to skip handlers of quarantined aggregates.
#[derive(Debug)]
pub(crate) struct Blacklist {
    segments: Vec<Mutex<HashSet<String>>>,
}

impl Blacklist {
    pub(crate) fn new(partitions: usize) -> Self {
        Self {
            segments: (0..partitions.max(1))
                .map(|_| Mutex::new(HashSet::new()))
                .collect(),
        }
    }

    fn segment(&self, aggregate_id: &str) -> &Mutex<HashSet<String>> {
        &self.segments[partition_for(aggregate_id, self.segments.len())]
    }

    pub(crate) fn contains(&self, aggregate_id: &str) -> bool {
        self.segment(aggregate_id)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(aggregate_id)
    }

    pub(crate) fn insert(&self, aggregate_id: &str) -> bool {
        self.segment(aggregate_id)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(aggregate_id.to_owned())
    }

    fn remove(&self, aggregate_id: &str) -> bool {
        self.segment(aggregate_id)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(aggregate_id)
    }
}

/// Collaborators shared by every publication worker.
pub(crate) struct PublicationContext<A: Aggregate> {
    pub(crate) store: Arc<dyn EventStore<A::DomainEvent>>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) bus: Option<Arc<dyn EventBus<A::DomainEvent>>>,
    pub(crate) transactions: Option<Arc<dyn TransactionManager>>,
    pub(crate) rollback: RollbackConfiguration,
    pub(crate) interceptors: Vec<Arc<dyn PublicationInterceptor<A>>>,
    pub(crate) blacklist: Arc<Blacklist>,
    pub(crate) reporter: ReportSender,
}

/// One publication partition.
pub(crate) struct PublicationWorker<A: Aggregate> {
    partition: usize,
    ctx: Arc<PublicationContext<A>>,
}

type SharedTransaction = Arc<Mutex<Option<Box<dyn Transaction>>>>;

fn take_transaction(slot: &SharedTransaction) -> Option<Box<dyn Transaction>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Runs a publication worker on the calling thread until its channel
/// closes.
pub(crate) fn run_publication<A: Aggregate>(
    mut worker: PublicationWorker<A>,
    mut rx: mpsc::UnboundedReceiver<PipelineTask<A>>,
) {
    tracing::debug!(partition = worker.partition, "publication worker started");
    while let Some(task) = rx.blocking_recv() {
        worker.process(task);
    }
    tracing::debug!(partition = worker.partition, "publication worker stopped");
}

impl<A: Aggregate> PublicationWorker<A> {
    pub(crate) fn new(partition: usize, ctx: Arc<PublicationContext<A>>) -> Self {
        Self { partition, ctx }
    }

    /// Whether `aggregate_id` is currently quarantined.
    pub(crate) fn is_blacklisted(&self, aggregate_id: &str) -> bool {
        self.ctx.blacklist.contains(aggregate_id)
    }

    /// Drive `task` to a terminal state.
    pub(crate) fn process(&mut self, task: PipelineTask<A>) -> TaskState {
        let mut task = match task.kind {
            TaskKind::Recovery { aggregate_id, ack } => {
                // Only the owning partition ever holds the entry.
                if partition_for(&aggregate_id, self.ctx.blacklist.segments.len())
                    == self.partition
                    && self.ctx.blacklist.remove(&aggregate_id)
                {
                    tracing::info!(
                        partition = self.partition,
                        aggregate_id = %aggregate_id,
                        "aggregate recovered, removed from blacklist"
                    );
                }
                let _ = ack.send(());
                return TaskState::Recovered;
            }
            TaskKind::Normal(_) if task.partition != self.partition => {
                tracing::error!(
                    partition = self.partition,
                    target = task.partition,
                    "skipping task addressed to another partition"
                );
                return TaskState::Skipped;
            }
            TaskKind::Normal(task) => task,
        };

        let state = self.settle(&mut task);
        if let Some(lock) = task.lock.take() {
            self.ctx.locks.release(lock);
        }
        self.report(task);
        state
    }

    fn settle(&mut self, task: &mut CommandTask<A>) -> TaskState {
        if let Some(aggregate_id) = &task.aggregate_id
            && self.ctx.blacklist.contains(aggregate_id)
        {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                command = %task.command.name(),
                "rejecting command for blacklisted aggregate"
            );
            let error = CommandError::AggregateCorrupted {
                aggregate_id: aggregate_id.clone(),
            };
            task.unit_of_work.rollback(&error);
            task.error = Some(error);
            return TaskState::RolledBack;
        }

        self.finalize(task);

        if let Some(error) = &task.error
            && self.ctx.rollback.rolls_back_on(error)
        {
            task.unit_of_work.rollback(error);
            if error.taints_aggregate()
                && let Some(aggregate_id) = &task.aggregate_id
            {
                self.quarantine(aggregate_id, error);
            }
            return TaskState::RolledBack;
        }

        match self.commit(task) {
            Ok(()) => TaskState::Committed,
            Err(error) => {
                task.unit_of_work.rollback(&error);
                let error = match &task.aggregate_id {
                    Some(aggregate_id) => {
                        self.quarantine(aggregate_id, &error);
                        CommandError::AggregateBlacklisted {
                            aggregate_id: aggregate_id.clone(),
                            cause: Box::new(error),
                        }
                    }
                    None => error,
                };
                task.error = Some(error);
                TaskState::RolledBack
            }
        }
    }

    fn finalize(&self, task: &mut CommandTask<A>) {
        for interceptor in &self.ctx.interceptors {
            let outcome = interceptor.intercept(
                &task.command,
                task.unit_of_work.events(),
                task.error.as_ref(),
            );
            if let Err(e) = outcome {
                tracing::warn!(command = %task.command.name(), error = %e, "interceptor failed");
                if task.error.is_none() {
                    task.error = Some(CommandError::Interceptor(e.to_string()));
                }
            }
        }
    }

    /// Commit attempt: validate the lock, then append, publish and commit
    /// the transaction as ordered unit-of-work hooks.
    fn commit(&self, task: &mut CommandTask<A>) -> Result<(), CommandError> {
        let uow = &mut task.unit_of_work;

        let transaction: Option<SharedTransaction> = match &self.ctx.transactions {
            Some(manager) => {
                let slot = Arc::new(Mutex::new(Some(manager.start_transaction()?)));
                let on_rollback = Arc::clone(&slot);
                uow.register_on_rollback(move |cause| {
                    if let Some(tx) = take_transaction(&on_rollback) {
                        tracing::debug!(error = %cause, "rolling back transaction");
                        tx.rollback();
                    }
                })?;
                Some(slot)
            }
            None => None,
        };

        if let Some(lock) = &task.lock {
            let stored = self.ctx.store.last_sequence_number(lock.aggregate_id())?;
            self.ctx.locks.validate(lock, stored)?;
        }

        let store = Arc::clone(&self.ctx.store);
        uow.register_on_commit(move |events| {
            if events.is_empty() {
                return Ok(());
            }
            store.append_events(events)?;
            tracing::info!(count = events.len(), "events appended");
            Ok(())
        })?;

        if let Some(bus) = &self.ctx.bus {
            let bus = Arc::clone(bus);
            uow.register_on_commit(move |events| {
                if events.is_empty() {
                    return Ok(());
                }
                bus.publish(events)
            })?;
        }

        if let Some(slot) = transaction {
            uow.register_on_commit(move |_| match take_transaction(&slot) {
                Some(tx) => tx.commit(),
                None => Ok(()),
            })?;
        }

        uow.commit()
    }

    fn quarantine(&self, aggregate_id: &str, cause: &CommandError) {
        if self.ctx.blacklist.insert(aggregate_id) {
            tracing::warn!(
                partition = self.partition,
                aggregate_id = %aggregate_id,
                error = %cause,
                "aggregate blacklisted until recovery"
            );
        }
    }

    fn report(&self, task: CommandTask<A>) {
        let CommandTask {
            command,
            callback,
            error,
            unit_of_work,
            ..
        } = task;
        match error {
            Some(error) => self.ctx.reporter.report(command, callback, Err(error)),
            None if callback.expects_result() => {
                self.ctx
                    .reporter
                    .report(command, callback, Ok(unit_of_work.into_events()));
            }
            None => {}
        }
    }
}
