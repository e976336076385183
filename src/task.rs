//! Working state of a command as it moves between pipeline stages.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::mpsc::Sender;

use crate::aggregate::Aggregate;
use crate::callback::CommandCallback;
use crate::command::CommandMessage;
use crate::error::CommandError;
use crate::event::DomainEventMessage;
use crate::lock::LockHandle;
use crate::unit_of_work::UnitOfWork;

/// Success result of a command: the events it committed, in order.
pub type CommandResult<E> = Vec<DomainEventMessage<E>>;

/// Callback type accepted by a pipeline for aggregate type `A`.
pub type BoxedCallback<A> = Box<
    dyn CommandCallback<<A as Aggregate>::Command, CommandResult<<A as Aggregate>::DomainEvent>>,
>;

/// Publication partition owning `aggregate_id` among `partitions`.
///
/// Deterministic for the lifetime of the process, so every task for one
/// aggregate lands on the same publication worker and the same lock-table
/// segment.
pub fn partition_for(aggregate_id: &str, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// Partition used for tasks without a resolved aggregate.
pub(crate) const UNROUTED_PARTITION: usize = 0;

/// A task addressed to one publication partition.
pub(crate) struct PipelineTask<A: Aggregate> {
    /// Partition the task was routed to.
    pub(crate) partition: usize,
    pub(crate) kind: TaskKind<A>,
}

/// What a [`PipelineTask`] carries.
pub(crate) enum TaskKind<A: Aggregate> {
    /// A dispatched command on its way to commit or rollback.
    Normal(CommandTask<A>),
    /// Lift the quarantine of `aggregate_id`, then signal `ack`.
    Recovery {
        aggregate_id: String,
        ack: Sender<()>,
    },
}

impl<A: Aggregate> PipelineTask<A> {
    pub(crate) fn normal(partition: usize, task: CommandTask<A>) -> Self {
        Self {
            partition,
            kind: TaskKind::Normal(task),
        }
    }

    pub(crate) fn recovery(
        partition: usize,
        aggregate_id: impl Into<String>,
        ack: Sender<()>,
    ) -> Self {
        Self {
            partition,
            kind: TaskKind::Recovery {
                aggregate_id: aggregate_id.into(),
                ack,
            },
        }
    }
}

/// In-flight state of one dispatched command.
///
/// Created by the handling stage, settled exactly once by the publication
/// stage.
pub(crate) struct CommandTask<A: Aggregate> {
    pub(crate) command: CommandMessage<A::Command>,
    pub(crate) callback: BoxedCallback<A>,
    pub(crate) aggregate_id: Option<String>,
    /// Failure captured so far; `None` means the task is still successful.
    pub(crate) error: Option<CommandError>,
    pub(crate) unit_of_work: UnitOfWork<A::DomainEvent>,
    /// Lock taken by the handling stage; released after settlement.
    pub(crate) lock: Option<LockHandle>,
}

impl<A: Aggregate> fmt::Debug for CommandTask<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTask")
            .field("command", &self.command.name())
            .field("command_id", &self.command.id())
            .field("aggregate_id", &self.aggregate_id)
            .field("error", &self.error)
            .field("unit_of_work", &self.unit_of_work)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
