//! External transaction boundary around store append and publication.

use crate::error::CommandError;

/// An open external transaction.
pub trait Transaction: Send {
    /// Make everything done inside the transaction durable.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Transaction`] if the commit fails; the unit
    /// of work is then rolled back and the aggregate blacklisted.
    fn commit(self: Box<Self>) -> Result<(), CommandError>;

    /// Undo everything done inside the transaction.
    fn rollback(self: Box<Self>);
}

/// Starts transactions for the publication stage.
///
/// When configured, each commit attempt starts one transaction before the
/// store append, commits it after the events have been published, and
/// rolls it back if anything in between fails.
pub trait TransactionManager: Send + Sync + 'static {
    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Transaction`] if no transaction can be opened.
    fn start_transaction(&self) -> Result<Box<dyn Transaction>, CommandError>;
}
