//! Transactional context for a single command.
//!
//! A [`UnitOfWork`] buffers the events a command produced and owns two
//! ordered hook lists. The publication stage wires store append, event bus
//! publication and external transactions in as hooks, so the unit of work
//! itself knows nothing about those concerns. It is created at the start of
//! handling, terminated exactly once (committed or rolled back) during
//! publication, and never reused.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CommandError;
use crate::event::DomainEventMessage;

/// Hook run on commit, in registration order, with the buffered events.
pub type CommitHook<E> =
    Box<dyn FnOnce(&[DomainEventMessage<E>]) -> Result<(), CommandError> + Send>;

/// Hook run on rollback, in registration order, with the cause.
pub type RollbackHook = Box<dyn FnOnce(&CommandError) + Send>;

/// String-keyed bag of opaque values threaded into handler invocation.
///
/// Cloning is cheap: values are reference counted.
#[derive(Clone, Default)]
pub struct Resources {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Resources {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    /// Store an already shared value under `key`.
    pub fn insert_shared(&mut self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.entries.insert(key.into(), value);
    }

    /// Look up `key` and downcast it to `T`.
    ///
    /// Returns `None` if the key is absent or holds a different type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key)?.downcast_ref::<T>()
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("Resources").field("keys", &keys).finish()
    }
}

/// Lifecycle phase of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting events and hooks.
    Active,
    /// Commit hooks all succeeded.
    Committed,
    /// Rolled back; buffered events were discarded.
    RolledBack,
}

/// Transactional context for one command.
///
/// # Type Parameters
///
/// * `E` - The domain event payload type.
pub struct UnitOfWork<E> {
    events: Vec<DomainEventMessage<E>>,
    commit_hooks: Vec<CommitHook<E>>,
    rollback_hooks: Vec<RollbackHook>,
    resources: Resources,
    phase: Phase,
}

impl<E> fmt::Debug for UnitOfWork<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("phase", &self.phase)
            .field("events", &self.events.len())
            .field("commit_hooks", &self.commit_hooks.len())
            .field("rollback_hooks", &self.rollback_hooks.len())
            .field("resources", &self.resources)
            .finish()
    }
}

impl<E> UnitOfWork<E> {
    /// Start an active unit of work carrying `resources`.
    pub fn new(resources: Resources) -> Self {
        Self {
            events: Vec::new(),
            commit_hooks: Vec::new(),
            rollback_hooks: Vec::new(),
            resources,
            phase: Phase::Active,
        }
    }

    /// Whether the unit of work has not yet been committed or rolled back.
    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The resource bag.
    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Mutable access to the resource bag.
    pub fn resources_mut(&mut self) -> &mut Resources {
        &mut self.resources
    }

    /// Events buffered for publication (empty after rollback).
    pub fn events(&self) -> &[DomainEventMessage<E>] {
        &self.events
    }

    /// Consume the unit of work, yielding its buffered events.
    pub fn into_events(self) -> Vec<DomainEventMessage<E>> {
        self.events
    }

    /// Buffer events to publish on commit.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnitOfWorkClosed`] if already terminated.
    pub fn buffer_events(
        &mut self,
        events: impl IntoIterator<Item = DomainEventMessage<E>>,
    ) -> Result<(), CommandError> {
        self.ensure_active()?;
        self.events.extend(events);
        Ok(())
    }

    /// Register a hook to run on [`commit`](UnitOfWork::commit).
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnitOfWorkClosed`] if already terminated.
    pub fn register_on_commit<F>(&mut self, hook: F) -> Result<(), CommandError>
    where
        F: FnOnce(&[DomainEventMessage<E>]) -> Result<(), CommandError> + Send + 'static,
    {
        self.ensure_active()?;
        self.commit_hooks.push(Box::new(hook));
        Ok(())
    }

    /// Register a hook to run on [`rollback`](UnitOfWork::rollback).
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnitOfWorkClosed`] if already terminated.
    pub fn register_on_rollback<F>(&mut self, hook: F) -> Result<(), CommandError>
    where
        F: FnOnce(&CommandError) + Send + 'static,
    {
        self.ensure_active()?;
        self.rollback_hooks.push(Box::new(hook));
        Ok(())
    }

    /// Run every commit hook in registration order, then mark committed.
    ///
    /// Stops at the first failing hook and returns its error. The unit of
    /// work then stays active so the caller can [`rollback`](UnitOfWork::rollback)
    /// with that error; hooks that already ran are not re-run.
    ///
    /// # Errors
    ///
    /// * [`CommandError::UnitOfWorkClosed`] -- already terminated.
    /// * Whatever the first failing hook returned.
    pub fn commit(&mut self) -> Result<(), CommandError> {
        self.ensure_active()?;
        for hook in std::mem::take(&mut self.commit_hooks) {
            hook(&self.events)?;
        }
        self.phase = Phase::Committed;
        self.rollback_hooks.clear();
        Ok(())
    }

    /// Run every rollback hook in registration order with `cause`, discard
    /// buffered events and mark rolled back.
    ///
    /// Calling this on a terminated unit of work is a no-op.
    pub fn rollback(&mut self, cause: &CommandError) {
        if !self.is_active() {
            return;
        }
        for hook in std::mem::take(&mut self.rollback_hooks) {
            hook(cause);
        }
        self.events.clear();
        self.commit_hooks.clear();
        self.phase = Phase::RolledBack;
    }

    fn ensure_active(&self) -> Result<(), CommandError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CommandError::UnitOfWorkClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use std::sync::Mutex;

    fn event(seq: u64) -> DomainEventMessage<u64> {
        DomainEventMessage::new("a", seq, seq, EventMetadata::default())
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let log = Arc::clone(&log);
            move |entry: &str| log.lock().expect("log lock").push(entry.to_owned())
        };
        (log, sink)
    }

    #[test]
    fn commit_runs_hooks_in_order_with_events() {
        let (log, sink) = recorder();
        let mut uow = UnitOfWork::new(Resources::new());
        uow.buffer_events([event(0), event(1)])
            .expect("buffer should succeed");

        let first = sink.clone();
        uow.register_on_commit(move |events| {
            first(&format!("first:{}", events.len()));
            Ok(())
        })
        .expect("register should succeed");
        let second = sink.clone();
        uow.register_on_commit(move |_| {
            second("second");
            Ok(())
        })
        .expect("register should succeed");

        uow.commit().expect("commit should succeed");
        assert_eq!(uow.phase(), Phase::Committed);
        assert!(!uow.is_active());
        assert_eq!(*log.lock().expect("log lock"), vec!["first:2", "second"]);
        assert_eq!(uow.events().len(), 2);
    }

    #[test]
    fn failed_commit_stays_active_and_rolls_back() {
        let (log, sink) = recorder();
        let mut uow = UnitOfWork::new(Resources::new());
        uow.buffer_events([event(0)]).expect("buffer should succeed");

        uow.register_on_commit(|_| Err(CommandError::Transaction("boom".into())))
            .expect("register should succeed");
        let never = sink.clone();
        uow.register_on_commit(move |_| {
            never("after-failure");
            Ok(())
        })
        .expect("register should succeed");
        let on_rollback = sink.clone();
        uow.register_on_rollback(move |cause| on_rollback(&format!("rollback:{cause}")))
            .expect("register should succeed");

        let err = uow.commit().expect_err("commit should fail");
        assert!(matches!(err, CommandError::Transaction(_)));
        assert!(uow.is_active());

        uow.rollback(&err);
        assert_eq!(uow.phase(), Phase::RolledBack);
        assert!(uow.events().is_empty());
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["rollback:transaction failed: boom"]
        );
    }

    #[test]
    fn rollback_twice_is_noop() {
        let (log, sink) = recorder();
        let mut uow = UnitOfWork::<u64>::new(Resources::new());
        uow.register_on_rollback(move |_| sink("rolled back"))
            .expect("register should succeed");

        uow.rollback(&CommandError::PipelineClosed);
        uow.rollback(&CommandError::PipelineClosed);
        assert_eq!(log.lock().expect("log lock").len(), 1);
    }

    #[test]
    fn rollback_hooks_do_not_run_after_commit() {
        let (log, sink) = recorder();
        let mut uow = UnitOfWork::<u64>::new(Resources::new());
        uow.register_on_rollback(move |_| sink("rolled back"))
            .expect("register should succeed");

        uow.commit().expect("commit should succeed");
        uow.rollback(&CommandError::PipelineClosed);
        assert!(log.lock().expect("log lock").is_empty());
        assert_eq!(uow.phase(), Phase::Committed);
    }

    #[test]
    fn terminated_unit_of_work_refuses_changes() {
        let mut uow = UnitOfWork::<u64>::new(Resources::new());
        uow.commit().expect("commit should succeed");

        assert!(matches!(uow.commit(), Err(CommandError::UnitOfWorkClosed)));
        assert!(matches!(
            uow.buffer_events([event(0)]),
            Err(CommandError::UnitOfWorkClosed)
        ));
        assert!(matches!(
            uow.register_on_commit(|_| Ok(())),
            Err(CommandError::UnitOfWorkClosed)
        ));
    }

    #[test]
    fn resources_downcast_by_type() {
        let mut resources = Resources::new();
        resources.insert("tenant", String::from("acme"));
        resources.insert("limit", 10u32);

        assert_eq!(resources.get::<String>("tenant").map(String::as_str), Some("acme"));
        assert_eq!(resources.get::<u32>("limit"), Some(&10));
        assert!(resources.get::<u64>("limit").is_none());
        assert!(resources.get::<u32>("missing").is_none());
        assert_eq!(resources.len(), 2);
        assert!(format!("{resources:?}").contains("tenant"));
    }
}
