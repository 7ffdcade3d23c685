//! Transaction context passed explicitly into every mutating operation.
//!
//! There is no ambient "current user" anywhere in the engine: whoever calls
//! a mutating operation supplies the acting user and the event name, and
//! those travel with the transaction into its journal records. This keeps
//! unit tests deterministic and free of thread-local setup.

/// Identity and intent of the caller for the duration of one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionContext {
    /// Acting user, recorded verbatim in journal records.
    pub user: String,
    /// Event name grouping the records of one logical client action.
    pub event: String,
}

impl TransactionContext {
    pub fn new(user: impl Into<String>, event: impl Into<String>) -> TransactionContext {
        return TransactionContext { user: user.into(), event: event.into() };
    }

    /// Context for engine-internal work such as journal replay.
    pub fn system(event: impl Into<String>) -> TransactionContext {
        return TransactionContext::new("#system", event);
    }
}
