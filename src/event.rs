//! Domain event envelope shared by the store, the repository, and the bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::CommandMessage;

/// Infrastructure metadata stamped on every event produced by the pipeline.
///
/// Makes each stored event self-describing: subscribers can recover the
/// aggregate type and the originating command without an external registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g., "counter").
    pub aggregate_type: String,
    /// Identifier of the command that produced the event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    /// Actor identity from the command metadata, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command metadata, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form metadata forwarded from the command, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl EventMetadata {
    /// Build metadata for events produced by `command`.
    pub fn for_command<C>(aggregate_type: &str, command: &CommandMessage<C>) -> Self {
        let meta = command.metadata();
        Self {
            aggregate_type: aggregate_type.to_owned(),
            command_id: Some(command.id()),
            actor: meta.actor.clone(),
            correlation_id: meta.correlation_id.clone(),
            extra: meta.extra.clone(),
        }
    }
}

/// A domain event bound to its aggregate and position in that aggregate's
/// stream.
///
/// Sequence numbers start at 0 and increase by exactly one per event within
/// an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventMessage<E> {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: String,
    /// Position within the aggregate's stream.
    pub sequence_number: u64,
    /// The domain event.
    pub payload: E,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
}

impl<E> DomainEventMessage<E> {
    /// Create an event with a fresh identifier.
    ///
    /// # Arguments
    ///
    /// * `aggregate_id` - Owning aggregate.
    /// * `sequence_number` - Position within the aggregate's stream.
    /// * `payload` - The domain event.
    /// * `metadata` - Infrastructure metadata.
    pub fn new(
        aggregate_id: impl Into<String>,
        sequence_number: u64,
        payload: E,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            sequence_number,
            payload,
            metadata,
        }
    }
}
