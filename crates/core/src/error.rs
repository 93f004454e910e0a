//! Error types for Rill.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// Result type alias for Rill operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types for collection, sync, query and translation operations.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid operation.
    InvalidOperation {
        message: String,
    },
    /// Item or record not found.
    NotFound {
        what: String,
    },
    /// A sync insert targeted a key that is already committed.
    DuplicateKeySync {
        collection: String,
        key: String,
    },
    /// A local insert targeted a key that is already visible.
    DuplicateKey {
        collection: String,
        key: String,
    },
    /// A local update or delete targeted a key that is not visible.
    KeyNotFound {
        collection: String,
        key: String,
    },
    /// `write` called without an open sync batch.
    NoPendingSyncTransactionWrite,
    /// `commit` called without an open sync batch.
    NoPendingSyncTransactionCommit,
    /// `commit` called on a batch that was already committed.
    SyncTransactionAlreadyCommitted,
    /// `write` called on a batch that was already committed.
    SyncTransactionAlreadyCommittedWrite,
    /// A local mutation was attempted without a configured handler.
    MissingHandler {
        operation: String,
    },
    /// The collection is in the error state.
    CollectionInErrorState {
        collection: String,
    },
    /// A source reported a failure.
    SyncFailed {
        collection: String,
        message: String,
    },
    /// No translation handler is registered for an operator.
    UnknownOperator {
        operator: String,
        available: Vec<String>,
    },
    /// An expression cannot be handled by the requested conversion.
    UnsupportedExpression {
        message: String,
    },
    /// Combining an empty list of expressions.
    EmptyExpressionList,
    /// A fractional index key is malformed or out of order.
    InvalidOrderKey {
        message: String,
    },
    /// The dataflow graph was used in the wrong phase.
    GraphState {
        message: String,
    },
    /// A query feature the compiler does not support.
    Unsupported {
        feature: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidOperation { message } => {
                write!(f, "Invalid operation: {}", message)
            }
            Error::NotFound { what } => {
                write!(f, "Not found: {}", what)
            }
            Error::DuplicateKeySync { collection, key } => {
                write!(
                    f,
                    "Cannot insert document with key \"{}\" from sync because it already exists in the collection \"{}\"",
                    key, collection
                )
            }
            Error::DuplicateKey { collection, key } => {
                write!(
                    f,
                    "Cannot insert document with key \"{}\" because it already exists in the collection \"{}\"",
                    key, collection
                )
            }
            Error::KeyNotFound { collection, key } => {
                write!(
                    f,
                    "Key \"{}\" does not exist in the collection \"{}\"",
                    key, collection
                )
            }
            Error::NoPendingSyncTransactionWrite => {
                write!(f, "No pending sync transaction to write to")
            }
            Error::NoPendingSyncTransactionCommit => {
                write!(f, "No pending sync transaction to commit")
            }
            Error::SyncTransactionAlreadyCommitted => {
                write!(f, "The pending sync transaction is already committed, you can't commit it again")
            }
            Error::SyncTransactionAlreadyCommittedWrite => {
                write!(f, "The pending sync transaction is already committed, you can't still write to it")
            }
            Error::MissingHandler { operation } => {
                write!(
                    f,
                    "Collection.{}() called directly but no on_{} handler is configured",
                    operation, operation
                )
            }
            Error::CollectionInErrorState { collection } => {
                write!(f, "Collection \"{}\" is in error state", collection)
            }
            Error::SyncFailed {
                collection,
                message,
            } => {
                write!(f, "Sync failed for collection \"{}\": {}", collection, message)
            }
            Error::UnknownOperator {
                operator,
                available,
            } => {
                write!(
                    f,
                    "No handler provided for operator: {}. Available handlers: {}",
                    operator,
                    available.join(", ")
                )
            }
            Error::UnsupportedExpression { message } => {
                write!(f, "{}", message)
            }
            Error::EmptyExpressionList => {
                write!(f, "Cannot combine empty expression list")
            }
            Error::InvalidOrderKey { message } => {
                write!(f, "Invalid order key: {}", message)
            }
            Error::GraphState { message } => {
                write!(f, "Dataflow graph error: {}", message)
            }
            Error::Unsupported { feature } => {
                write!(f, "Unsupported: {}", feature)
            }
        }
    }
}

impl Error {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Creates a duplicate sync key error.
    pub fn duplicate_key_sync(collection: impl Into<String>, key: impl fmt::Display) -> Self {
        Error::DuplicateKeySync {
            collection: collection.into(),
            key: alloc::format!("{}", key),
        }
    }

    /// Creates a duplicate local key error.
    pub fn duplicate_key(collection: impl Into<String>, key: impl fmt::Display) -> Self {
        Error::DuplicateKey {
            collection: collection.into(),
            key: alloc::format!("{}", key),
        }
    }

    /// Creates a missing key error.
    pub fn key_not_found(collection: impl Into<String>, key: impl fmt::Display) -> Self {
        Error::KeyNotFound {
            collection: collection.into(),
            key: alloc::format!("{}", key),
        }
    }

    /// Creates a missing mutation handler error.
    pub fn missing_handler(operation: impl Into<String>) -> Self {
        Error::MissingHandler {
            operation: operation.into(),
        }
    }

    /// Creates a collection error state error.
    pub fn collection_in_error_state(collection: impl Into<String>) -> Self {
        Error::CollectionInErrorState {
            collection: collection.into(),
        }
    }

    /// Creates a sync failure error.
    pub fn sync_failed(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SyncFailed {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown operator error listing the registered handlers.
    pub fn unknown_operator(operator: impl Into<String>, available: Vec<String>) -> Self {
        Error::UnknownOperator {
            operator: operator.into(),
            available,
        }
    }

    /// Creates an unsupported expression error.
    pub fn unsupported_expression(message: impl Into<String>) -> Self {
        Error::UnsupportedExpression {
            message: message.into(),
        }
    }

    pub fn invalid_order_key(message: impl Into<String>) -> Self {
        Error::InvalidOrderKey {
            message: message.into(),
        }
    }

    pub fn graph_state(message: impl Into<String>) -> Self {
        Error::GraphState {
            message: message.into(),
        }
    }

    pub fn unsupported(feature: impl Into<String>) -> Self {
        Error::Unsupported {
            feature: feature.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn test_error_display() {
        let err = Error::duplicate_key_sync("todos", 7);
        assert!(err.to_string().contains("\"7\""));
        assert!(err.to_string().contains("todos"));

        let err = Error::NoPendingSyncTransactionWrite;
        assert!(err.to_string().contains("No pending sync transaction"));

        let err = Error::missing_handler("insert");
        assert!(err.to_string().contains("on_insert"));
    }

    #[test]
    fn test_unknown_operator_lists_handlers() {
        let err = Error::unknown_operator("like", vec!["eq".into(), "gt".into()]);
        assert_eq!(
            err.to_string(),
            "No handler provided for operator: like. Available handlers: eq, gt"
        );
    }

    #[test]
    fn test_error_constructors() {
        let err = Error::sync_failed("users", "connection lost");
        match err {
            Error::SyncFailed { collection, .. } => assert_eq!(collection, "users"),
            _ => panic!("Wrong error type"),
        }
    }
}
