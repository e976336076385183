//! The handling stage: a single writer that runs every command handler.
//!
//! One dedicated thread drains the pipeline inbox in order. For each
//! command it resolves the target aggregate, takes the lock, loads the
//! aggregate, invokes the handler and buffers the produced events in a
//! fresh unit of work. Failures are recorded on the task rather than
//! reported here, so the publication stage does all rollback and blacklist
//! bookkeeping in one place.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::aggregate::Aggregate;
use crate::callback::ReportSender;
use crate::command::CommandMessage;
use crate::error::CommandError;
use crate::lock::LockManager;
use crate::publication::Blacklist;
use crate::registry::{HandlerRegistry, Registration};
use crate::repository::{EventSourcingRepository, LoadedAggregate};
use crate::task::{
    BoxedCallback, CommandTask, PipelineTask, TaskKind, UNROUTED_PARTITION, partition_for,
};
use crate::unit_of_work::{Resources, UnitOfWork};

/// Resource key under which every unit of work carries its command id.
pub const COMMAND_ID_RESOURCE: &str = "command_id";

/// Names the aggregate a command targets.
///
/// Returning `None` fails the command with
/// [`CommandError::AggregateIdUnresolved`].
pub trait AggregateIdResolver<C>: Send + Sync + 'static {
    /// The target aggregate id of `command`, if any.
    fn resolve(&self, command: &CommandMessage<C>) -> Option<String>;
}

impl<C, F> AggregateIdResolver<C> for F
where
    F: Fn(&CommandMessage<C>) -> Option<String> + Send + Sync + 'static,
{
    fn resolve(&self, command: &CommandMessage<C>) -> Option<String> {
        self(command)
    }
}

/// Messages accepted by the handling stage.
pub(crate) enum Inbound<A: Aggregate> {
    /// Run a command.
    Dispatch {
        command: CommandMessage<A::Command>,
        callback: BoxedCallback<A>,
    },
    /// Broadcast a recovery signal to every publication partition.
    Recover { aggregate_id: String },
    /// Stop after the messages already queued ahead of this one.
    Shutdown,
}

/// Everything the handling thread owns.
pub(crate) struct HandlingStage<A: Aggregate> {
    pub(crate) registry: Arc<HandlerRegistry<A>>,
    pub(crate) resolver: Arc<dyn AggregateIdResolver<A::Command>>,
    pub(crate) repository: EventSourcingRepository<A>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) resources: Resources,
    pub(crate) partitions: Vec<mpsc::UnboundedSender<PipelineTask<A>>>,
    pub(crate) blacklist: Arc<Blacklist>,
    pub(crate) reporter: ReportSender,
}

/// Runs the handling loop on the calling thread until shutdown.
///
/// Messages still queued behind the shutdown marker are failed with
/// [`CommandError::PipelineClosed`]. Returning drops the partition senders,
/// which lets the publication workers drain and stop.
pub(crate) fn run_handling<A: Aggregate>(
    stage: HandlingStage<A>,
    mut rx: mpsc::UnboundedReceiver<Inbound<A>>,
) {
    tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, "handling stage started");
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            Inbound::Dispatch { command, callback } => stage.handle(command, callback),
            Inbound::Recover { aggregate_id } => stage.broadcast_recovery(&aggregate_id),
            Inbound::Shutdown => break,
        }
    }

    rx.close();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            Inbound::Dispatch { command, callback } => {
                stage
                    .reporter
                    .report(command, callback, Err(CommandError::PipelineClosed));
            }
            Inbound::Recover { aggregate_id } => {
                tracing::warn!(aggregate_id = %aggregate_id, "recovery signal dropped at shutdown");
            }
            Inbound::Shutdown => {}
        }
    }
    tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, "handling stage stopped");
}

impl<A: Aggregate> HandlingStage<A> {
    fn handle(&self, command: CommandMessage<A::Command>, callback: BoxedCallback<A>) {
        let Some(registration) = self.registry.resolve(command.name()) else {
            tracing::warn!(command = %command.name(), "no handler registered for command");
            let error = CommandError::NoHandler {
                command_name: command.name().to_owned(),
            };
            self.reporter.report(command, callback, Err(error));
            return;
        };

        let aggregate_id = self.resolver.resolve(&command);
        let partition = aggregate_id
            .as_deref()
            .map_or(UNROUTED_PARTITION, |id| partition_for(id, self.partitions.len()));

        let mut resources = self.resources.clone();
        resources.insert(COMMAND_ID_RESOURCE, command.id());

        let mut task = CommandTask {
            command,
            callback,
            aggregate_id,
            error: None,
            unit_of_work: UnitOfWork::new(resources),
            lock: None,
        };
        if let Some(aggregate_id) = &task.aggregate_id
            && self.blacklist.contains(aggregate_id)
        {
            tracing::debug!(aggregate_id = %aggregate_id, "aggregate blacklisted, handler skipped");
            task.error = Some(CommandError::AggregateCorrupted {
                aggregate_id: aggregate_id.clone(),
            });
        } else if let Err(error) = self.execute(&registration, &mut task) {
            tracing::debug!(
                command = %task.command.name(),
                error = %error,
                "command failed during handling"
            );
            task.error = Some(error);
        }
        self.forward(PipelineTask::normal(partition, task));
    }

    /// Lock, load, decide and buffer. The lock handle is stored on the task
    /// as soon as it is taken so publication always releases it.
    fn execute(
        &self,
        registration: &Registration<A>,
        task: &mut CommandTask<A>,
    ) -> Result<(), CommandError> {
        let Some(aggregate_id) = task.aggregate_id.clone() else {
            return Err(CommandError::AggregateIdUnresolved {
                command_name: task.command.name().to_owned(),
            });
        };
        let _span = tracing::info_span!(
            "handle",
            command = %task.command.name(),
            aggregate_id = %aggregate_id,
        )
        .entered();

        task.lock = Some(self.locks.acquire(&aggregate_id)?);
        // The previous holder may have quarantined the aggregate while we waited.
        if self.blacklist.contains(&aggregate_id) {
            return Err(CommandError::AggregateCorrupted { aggregate_id });
        }

        let mut aggregate = if registration.creates_aggregate() {
            if self.repository.current_version(&aggregate_id)?.is_some() {
                return Err(CommandError::AggregateAlreadyExists { aggregate_id });
            }
            LoadedAggregate::<A>::new(aggregate_id)
        } else {
            self.repository.load(&aggregate_id)?
        };
        if let Some(lock) = task.lock.as_mut() {
            lock.record_version(aggregate.version);
        }

        let events = registration.handler().handle(
            &aggregate.state,
            &task.command,
            task.unit_of_work.resources(),
        )?;
        let staged = self.repository.stage(&mut aggregate, events, &task.command);
        task.unit_of_work.buffer_events(staged)
    }

    fn forward(&self, task: PipelineTask<A>) {
        let Some(partition) = self.partitions.get(task.partition) else {
            tracing::error!(partition = task.partition, "task routed to unknown partition");
            return;
        };
        if let Err(mpsc::error::SendError(task)) = partition.send(task) {
            // Publication worker is gone; fail the command here instead.
            if let TaskKind::Normal(mut task) = task.kind {
                self.fail_undeliverable(&mut task);
                self.reporter
                    .report(task.command, task.callback, Err(CommandError::PipelineClosed));
            }
        }
    }

    fn fail_undeliverable(&self, task: &mut CommandTask<A>) {
        task.unit_of_work.rollback(&CommandError::PipelineClosed);
        if let Some(lock) = task.lock.take() {
            self.locks.release(lock);
        }
    }

    /// Send the recovery signal to every partition and wait until each has
    /// applied it, so commands handled afterwards see the cleared blacklist.
    fn broadcast_recovery(&self, aggregate_id: &str) {
        tracing::info!(aggregate_id = %aggregate_id, "broadcasting recovery signal");
        let (ack, acked) = std::sync::mpsc::channel();
        let mut delivered = 0;
        for (partition, tx) in self.partitions.iter().enumerate() {
            if tx
                .send(PipelineTask::recovery(partition, aggregate_id, ack.clone()))
                .is_ok()
            {
                delivered += 1;
            } else {
                tracing::warn!(partition, "publication worker gone, recovery not delivered");
            }
        }
        drop(ack);
        for _ in 0..delivered {
            if acked.recv().is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand, CounterEvent};
    use crate::callback::{CallbackReporter, NoOpCallback};
    use crate::event::{DomainEventMessage, EventMetadata};
    use crate::lock::PessimisticLockManager;
    use crate::store::{EventStore, InMemoryEventStore};
    use std::time::Duration;

    struct Fixture {
        stage: HandlingStage<Counter>,
        outputs: Vec<mpsc::UnboundedReceiver<PipelineTask<Counter>>>,
        store: Arc<InMemoryEventStore<CounterEvent>>,
        locks: Arc<PessimisticLockManager>,
        _reporter: CallbackReporter,
    }

    fn fixture(partitions: usize) -> Fixture {
        let store = Arc::new(InMemoryEventStore::new());
        let locks = Arc::new(PessimisticLockManager::new(Duration::from_millis(20), partitions));
        let registry = HandlerRegistry::<Counter>::new()
            .with_aggregate_creation("CreateCounter")
            .with_aggregate_handler("ChangeCounter")
            .with_aggregate_handler("Fail");
        let reporter = CallbackReporter::start(1).expect("reporter should start");
        let (senders, outputs) = (0..partitions).map(|_| mpsc::unbounded_channel()).unzip();
        let stage = HandlingStage {
            registry: Arc::new(registry),
            resolver: Arc::new(|cmd: &CommandMessage<CounterCommand>| {
                cmd.metadata().correlation_id.clone()
            }),
            repository: EventSourcingRepository::new(store.clone()),
            locks: locks.clone(),
            resources: Resources::new(),
            partitions: senders,
            blacklist: Arc::new(Blacklist::new(partitions)),
            reporter: reporter.sender(),
        };
        Fixture {
            stage,
            outputs,
            store,
            locks,
            _reporter: reporter,
        }
    }

    fn targeted(name: &str, payload: CounterCommand, id: &str) -> CommandMessage<CounterCommand> {
        CommandMessage::new(name, payload)
            .with_metadata(crate::command::CommandMetadata::default().with_correlation_id(id))
    }

    fn next_task(fx: &mut Fixture, id: &str) -> CommandTask<Counter> {
        let partition = partition_for(id, fx.outputs.len());
        let task = fx.outputs[partition]
            .try_recv()
            .expect("task should be forwarded to the owning partition");
        assert_eq!(task.partition, partition);
        match task.kind {
            TaskKind::Normal(task) => task,
            TaskKind::Recovery { .. } => panic!("expected a command task"),
        }
    }

    #[test]
    fn creation_command_stages_first_event_at_zero() {
        let mut fx = fixture(2);
        fx.stage.handle(
            targeted("CreateCounter", CounterCommand::Create, "c-1"),
            Box::new(NoOpCallback),
        );

        let task = next_task(&mut fx, "c-1");
        assert!(task.error.is_none(), "unexpected error: {:?}", task.error);
        let events = task.unit_of_work.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence_number, 0);
        assert_eq!(events[0].payload, CounterEvent::Created);
        assert!(task.unit_of_work.resources().contains(COMMAND_ID_RESOURCE));
        assert!(fx.locks.is_locked("c-1"), "lock stays held until publication");
    }

    #[test]
    fn existing_aggregate_is_loaded_and_continues_sequence() {
        let mut fx = fixture(2);
        fx.store
            .append_events(&[DomainEventMessage::new(
                "c-1",
                0,
                CounterEvent::Created,
                EventMetadata::default(),
            )])
            .expect("seed should succeed");

        fx.stage.handle(
            targeted("ChangeCounter", CounterCommand::Change(5), "c-1"),
            Box::new(NoOpCallback),
        );
        let task = next_task(&mut fx, "c-1");
        let events = task.unit_of_work.events();
        assert_eq!(events[0].sequence_number, 1);
        assert_eq!(events[0].payload, CounterEvent::Changed { counter: 5 });
        assert_eq!(
            task.lock.as_ref().and_then(|l| l.expected_version()),
            Some(0)
        );
    }

    #[test]
    fn failures_are_recorded_not_reported() {
        let mut fx = fixture(1);
        fx.stage.handle(
            targeted("ChangeCounter", CounterCommand::Change(1), "missing"),
            Box::new(NoOpCallback),
        );
        let task = next_task(&mut fx, "missing");
        assert!(matches!(
            task.error,
            Some(CommandError::AggregateNotFound { ref aggregate_id }) if aggregate_id == "missing"
        ));
        assert!(task.lock.is_some(), "handle is kept for release by publication");
        assert!(task.unit_of_work.events().is_empty());
    }

    #[test]
    fn creating_an_existing_aggregate_fails() {
        let mut fx = fixture(1);
        fx.store
            .append_events(&[DomainEventMessage::new(
                "c-1",
                0,
                CounterEvent::Created,
                EventMetadata::default(),
            )])
            .expect("seed should succeed");

        fx.stage.handle(
            targeted("CreateCounter", CounterCommand::Create, "c-1"),
            Box::new(NoOpCallback),
        );
        let task = next_task(&mut fx, "c-1");
        assert!(matches!(
            task.error,
            Some(CommandError::AggregateAlreadyExists { .. })
        ));
    }

    #[test]
    fn unresolved_target_goes_to_fixed_partition() {
        let mut fx = fixture(3);
        fx.stage.handle(
            CommandMessage::new("ChangeCounter", CounterCommand::Change(1)),
            Box::new(NoOpCallback),
        );
        let task = fx.outputs[UNROUTED_PARTITION]
            .try_recv()
            .expect("task should be forwarded");
        let TaskKind::Normal(task) = task.kind else {
            panic!("expected a command task");
        };
        assert!(matches!(
            task.error,
            Some(CommandError::AggregateIdUnresolved { .. })
        ));
        assert!(task.lock.is_none());
    }

    #[test]
    fn unknown_command_is_not_forwarded() {
        let mut fx = fixture(2);
        fx.stage.handle(
            targeted("Nope", CounterCommand::Create, "c-1"),
            Box::new(NoOpCallback),
        );
        assert!(fx.outputs.iter_mut().all(|rx| rx.try_recv().is_err()));
    }

    #[test]
    fn recovery_reaches_every_partition() {
        let mut fx = fixture(3);
        let stage = &fx.stage;
        let outputs = &mut fx.outputs;
        std::thread::scope(|s| {
            let broadcaster = s.spawn(|| stage.broadcast_recovery("c-9"));
            for (index, rx) in outputs.iter_mut().enumerate() {
                let task = rx.blocking_recv().expect("recovery should be delivered");
                assert_eq!(task.partition, index);
                match task.kind {
                    TaskKind::Recovery { aggregate_id, ack } => {
                        assert_eq!(aggregate_id, "c-9");
                        ack.send(()).expect("broadcaster should wait for acks");
                    }
                    TaskKind::Normal(_) => panic!("expected a recovery task"),
                }
            }
            broadcaster.join().expect("broadcast should finish");
        });
    }

    #[test]
    fn blacklisted_aggregate_skips_handler() {
        let mut fx = fixture(2);
        fx.stage.blacklist.insert("c-1");
        fx.stage.handle(
            targeted("CreateCounter", CounterCommand::Create, "c-1"),
            Box::new(NoOpCallback),
        );
        let task = next_task(&mut fx, "c-1");
        assert!(matches!(
            task.error,
            Some(CommandError::AggregateCorrupted { .. })
        ));
        assert!(task.lock.is_none(), "no lock is taken for a quarantined aggregate");
        assert!(task.unit_of_work.events().is_empty());
    }

    #[test]
    fn quarantine_seen_after_lock_wait_stops_handling() {
        let fx = fixture(2);
        let registration = fx
            .stage
            .registry
            .resolve("CreateCounter")
            .expect("handler should be registered");
        let mut task = CommandTask::<Counter> {
            command: targeted("CreateCounter", CounterCommand::Create, "c-1"),
            callback: Box::new(NoOpCallback),
            aggregate_id: Some("c-1".into()),
            error: None,
            unit_of_work: UnitOfWork::new(Resources::new()),
            lock: None,
        };
        // Quarantined by the previous lock holder, after the entry check.
        fx.stage.blacklist.insert("c-1");

        let result = fx.stage.execute(&registration, &mut task);
        assert!(matches!(
            result,
            Err(CommandError::AggregateCorrupted { ref aggregate_id }) if aggregate_id == "c-1"
        ));
        assert!(task.unit_of_work.events().is_empty());
        assert!(task.lock.is_some(), "handle stays on the task for publication to release");
        assert!(fx.locks.is_locked("c-1"));
    }

    #[test]
    fn lock_timeout_is_recorded() {
        let mut fx = fixture(1);
        // Hold the lock out of band.
        let handle = fx.locks.acquire("c-1").expect("acquire should succeed");
        fx.stage.handle(
            targeted("ChangeCounter", CounterCommand::Change(1), "c-1"),
            Box::new(NoOpCallback),
        );
        let task = next_task(&mut fx, "c-1");
        assert!(matches!(task.error, Some(CommandError::LockTimeout { .. })));
        assert!(task.lock.is_none());
        fx.locks.release(handle);
    }
}
