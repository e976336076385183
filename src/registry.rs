//! Dispatch registry: command name to statically known handler.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use crate::aggregate::Aggregate;
use crate::command::CommandMessage;
use crate::error::CommandError;
use crate::unit_of_work::Resources;

/// Decides which events a command produces against an aggregate's state.
///
/// Implementations must be pure with respect to the aggregate: they read
/// `aggregate` and return events, they never mutate state themselves.
pub trait CommandHandler<A: Aggregate>: Send + Sync + 'static {
    /// Handle `command` against the current `aggregate` state.
    ///
    /// # Arguments
    ///
    /// * `aggregate` - State folded from the aggregate's stream (or
    ///   `A::default()` for a creation command).
    /// * `command` - The dispatched command.
    /// * `resources` - The unit of work's resource bag.
    ///
    /// # Errors
    ///
    /// Any [`CommandError`]; domain rejections are usually wrapped with
    /// [`CommandError::handler`].
    fn handle(
        &self,
        aggregate: &A,
        command: &CommandMessage<A::Command>,
        resources: &Resources,
    ) -> Result<Vec<A::DomainEvent>, CommandError>;
}

/// Adapter that routes to [`Aggregate::handle`].
struct AggregateHandler<A>(PhantomData<fn() -> A>);

impl<A: Aggregate> CommandHandler<A> for AggregateHandler<A> {
    fn handle(
        &self,
        aggregate: &A,
        command: &CommandMessage<A::Command>,
        _resources: &Resources,
    ) -> Result<Vec<A::DomainEvent>, CommandError> {
        aggregate
            .handle(command.payload())
            .map_err(CommandError::handler)
    }
}

/// Adapter for plain closures.
struct FnHandler<F>(F);

impl<A, F> CommandHandler<A> for FnHandler<F>
where
    A: Aggregate,
    F: Fn(&A, &CommandMessage<A::Command>, &Resources) -> Result<Vec<A::DomainEvent>, CommandError>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        aggregate: &A,
        command: &CommandMessage<A::Command>,
        resources: &Resources,
    ) -> Result<Vec<A::DomainEvent>, CommandError> {
        (self.0)(aggregate, command, resources)
    }
}

/// A resolved registry entry.
pub struct Registration<A: Aggregate> {
    handler: Arc<dyn CommandHandler<A>>,
    creates_aggregate: bool,
}

impl<A: Aggregate> Clone for Registration<A> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            creates_aggregate: self.creates_aggregate,
        }
    }
}

impl<A: Aggregate> fmt::Debug for Registration<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("creates_aggregate", &self.creates_aggregate)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> Registration<A> {
    /// The handler to invoke.
    pub fn handler(&self) -> &dyn CommandHandler<A> {
        self.handler.as_ref()
    }

    /// Whether the command creates a new aggregate instead of loading one.
    pub fn creates_aggregate(&self) -> bool {
        self.creates_aggregate
    }
}

/// Maps command names to handlers for aggregate type `A`.
///
/// Built once at startup; handlers can still be added or removed at runtime
/// through [`CommandPipeline::subscribe`](crate::CommandPipeline::subscribe).
pub struct HandlerRegistry<A: Aggregate> {
    handlers: RwLock<HashMap<String, Registration<A>>>,
}

impl<A: Aggregate> Default for HandlerRegistry<A> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<A: Aggregate> fmt::Debug for HandlerRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("commands", &self.supported_command_names())
            .finish()
    }
}

impl<A: Aggregate> HandlerRegistry<A> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `name` to [`Aggregate::handle`] on a loaded aggregate.
    pub fn with_aggregate_handler(self, name: impl Into<String>) -> Self {
        self.insert(name.into(), Arc::new(AggregateHandler::<A>(PhantomData)), false);
        self
    }

    /// Route `name` to [`Aggregate::handle`] on a brand-new aggregate.
    pub fn with_aggregate_creation(self, name: impl Into<String>) -> Self {
        self.insert(name.into(), Arc::new(AggregateHandler::<A>(PhantomData)), true);
        self
    }

    /// Route `name` to a closure operating on a loaded aggregate.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&A, &CommandMessage<A::Command>, &Resources) -> Result<Vec<A::DomainEvent>, CommandError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name.into(), Arc::new(FnHandler(handler)), false);
    }

    /// Route `name` to a closure that creates a new aggregate.
    ///
    /// The closure receives `A::default()`; the first produced event gets
    /// sequence number 0.
    pub fn register_creation<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&A, &CommandMessage<A::Command>, &Resources) -> Result<Vec<A::DomainEvent>, CommandError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name.into(), Arc::new(FnHandler(handler)), true);
    }

    /// Route `name` to an arbitrary [`CommandHandler`] implementation.
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler<A>>,
        creates_aggregate: bool,
    ) {
        self.insert(name.into(), handler, creates_aggregate);
    }

    /// Remove the handler for `name`. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.remove(name).is_some()
    }

    /// Resolve the handler registered for `name`.
    pub fn resolve(&self, name: &str) -> Option<Registration<A>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(name).cloned()
    }

    /// Names of every command with a registered handler, sorted.
    pub fn supported_command_names(&self) -> BTreeSet<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.keys().cloned().collect()
    }

    fn insert(&self, name: String, handler: Arc<dyn CommandHandler<A>>, creates_aggregate: bool) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let previous = handlers.insert(
            name.clone(),
            Registration {
                handler,
                creates_aggregate,
            },
        );
        if previous.is_some() {
            tracing::warn!(command = %name, "replaced existing command handler");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand, CounterError, CounterEvent};

    #[test]
    fn resolve_unknown_is_none() {
        let registry = HandlerRegistry::<Counter>::new();
        assert!(registry.resolve("Nope").is_none());
        assert!(registry.supported_command_names().is_empty());
    }

    #[test]
    fn aggregate_handler_delegates_to_handle() {
        let registry = HandlerRegistry::<Counter>::new().with_aggregate_handler("ChangeCounter");
        let registration = registry
            .resolve("ChangeCounter")
            .expect("handler should be registered");
        assert!(!registration.creates_aggregate());

        let events = registration
            .handler()
            .handle(
                &Counter::default(),
                &CommandMessage::new("ChangeCounter", CounterCommand::Change(4)),
                &Resources::new(),
            )
            .expect("handle should succeed");
        assert_eq!(events, vec![CounterEvent::Changed { counter: 4 }]);
    }

    #[test]
    fn aggregate_handler_wraps_domain_error() {
        let registry = HandlerRegistry::<Counter>::new().with_aggregate_handler("Fail");
        let err = registry
            .resolve("Fail")
            .expect("handler should be registered")
            .handler()
            .handle(
                &Counter::default(),
                &CommandMessage::new("Fail", CounterCommand::Fail),
                &Resources::new(),
            )
            .expect_err("handle should fail");
        assert!(matches!(
            err.domain_error::<CounterError>(),
            Some(CounterError::Requested)
        ));
    }

    #[test]
    fn closure_handler_sees_resources() {
        let registry = HandlerRegistry::<Counter>::new();
        registry.register("Bump", |state: &Counter, _cmd, resources| {
            let step = resources.get::<u64>("step").copied().unwrap_or(1);
            Ok(vec![CounterEvent::Changed {
                counter: state.value + step,
            }])
        });

        let mut resources = Resources::new();
        resources.insert("step", 5u64);
        let events = registry
            .resolve("Bump")
            .expect("handler should be registered")
            .handler()
            .handle(
                &Counter::default(),
                &CommandMessage::new("Bump", CounterCommand::Change(0)),
                &resources,
            )
            .expect("handle should succeed");
        assert_eq!(events, vec![CounterEvent::Changed { counter: 5 }]);
    }

    #[test]
    fn creation_flag_and_unregister() {
        let registry = HandlerRegistry::<Counter>::new()
            .with_aggregate_creation("CreateCounter")
            .with_aggregate_handler("ChangeCounter");

        assert!(
            registry
                .resolve("CreateCounter")
                .expect("handler should be registered")
                .creates_aggregate()
        );
        assert_eq!(
            registry.supported_command_names().into_iter().collect::<Vec<_>>(),
            vec!["ChangeCounter", "CreateCounter"]
        );

        assert!(registry.unregister("CreateCounter"));
        assert!(!registry.unregister("CreateCounter"));
        assert!(registry.resolve("CreateCounter").is_none());
    }
}
