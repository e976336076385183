//! Command message and metadata types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// command payload. Fields are copied onto the
/// [`EventMetadata`](crate::event::EventMetadata) of every event the command
/// produces.
///
/// # Examples
///
/// ```
/// use eventfold_pipeline::CommandMetadata;
/// use serde_json::json;
///
/// let meta = CommandMetadata::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_extra(json!({"source": "api"}));
///
/// assert_eq!(meta.actor.as_deref(), Some("user-42"));
/// assert_eq!(meta.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(meta.extra.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata forwarded to produced events.
    pub extra: Option<Value>,
}

impl CommandMetadata {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary extra metadata.
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// An immutable command addressed to the pipeline.
///
/// The `name` selects the handler in the
/// [`HandlerRegistry`](crate::registry::HandlerRegistry); the `payload` is
/// the aggregate's typed command.
///
/// # Type Parameters
///
/// * `C` - The command payload type, usually `A::Command`.
#[derive(Debug, Clone)]
pub struct CommandMessage<C> {
    id: Uuid,
    name: String,
    payload: C,
    metadata: CommandMetadata,
}

impl<C> CommandMessage<C> {
    /// Create a command with a fresh identifier and empty metadata.
    ///
    /// # Arguments
    ///
    /// * `name` - Command type name used for handler resolution.
    /// * `payload` - The typed command.
    pub fn new(name: impl Into<String>, payload: C) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            metadata: CommandMetadata::default(),
        }
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: CommandMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Unique identifier of this command message.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Command type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The typed payload.
    pub fn payload(&self) -> &C {
        &self.payload
    }

    /// Cross-cutting metadata.
    pub fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_metadata_has_no_fields_set() {
        let meta = CommandMetadata::default();
        assert_eq!(meta.actor, None);
        assert_eq!(meta.correlation_id, None);
        assert_eq!(meta.extra, None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let meta = CommandMetadata::default()
            .with_actor("admin")
            .with_correlation_id("req-abc")
            .with_extra(json!({"source": "test"}));

        assert_eq!(meta.actor.as_deref(), Some("admin"));
        assert_eq!(meta.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(meta.extra, Some(json!({"source": "test"})));
    }

    #[test]
    fn new_commands_get_distinct_ids() {
        let a = CommandMessage::new("ChangeCounter", 1u64);
        let b = CommandMessage::new("ChangeCounter", 1u64);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "ChangeCounter");
        assert_eq!(*a.payload(), 1);
    }

    #[test]
    fn clone_keeps_identity() {
        let cmd = CommandMessage::new("ChangeCounter", 5u64)
            .with_metadata(CommandMetadata::default().with_actor("user-1"));
        let cloned = cmd.clone();
        assert_eq!(cloned.id(), cmd.id());
        assert_eq!(cloned.metadata().actor.as_deref(), Some("user-1"));
    }
}
