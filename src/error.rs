//! Contains the `Error` and `Result` types used by this crate.

use std::{collections::HashSet, sync::Arc};

use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::bson::Document;

const RECOVERING_CODES: &[i32] = &[11600, 11602, 13436, 189, 91];
const NOT_PRIMARY_CODES: &[i32] = &[10107, 13435, 10058];
const SHUTTING_DOWN_CODES: &[i32] = &[11600, 91];
const RETRYABLE_READ_CODES: &[i32] = &[11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134];
const RETRYABLE_WRITE_CODES: &[i32] =
    &[11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262];

/// Write concern error codes that guarantee the associated write did not commit.
const UNKNOWN_COMMIT_EXCLUDED_CODE_NAMES: &[&str] =
    &["CannotSatisfyWriteConcern", "UnsatisfiableWriteConcern", "UnknownReplWriteConcern"];

/// Retryable write label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Generic retryability label attached by the server alongside
/// [`SYSTEM_OVERLOADED_ERROR`] when an overloaded server considers the failed
/// attempt safe to retry.
pub const RETRYABLE_ERROR: &str = "RetryableError";

/// Label attached by an overloaded server asking the client to shed load.
pub const SYSTEM_OVERLOADED_ERROR: &str = "SystemOverloadedError";

/// Transient transaction error label. This label will be added to a network error or server-side
/// "TransientTransactionError" within a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Unknown transaction commit result label. This label will be added to a server-side
/// "UnknownTransactionCommitResult" from a commitTransaction.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// Label attached by the server when a failed write performed no writes at all,
/// meaning an earlier error from the same retry sequence is at least as
/// informative.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the driver core. The inner [`ErrorKind`] is wrapped in a `Box` to
/// allow the errors to be cheaply moved and cloned.
#[derive(Clone, Debug, ThisError)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut error = Self {
            kind: Box::new(kind),
            labels: Default::default(),
        };
        if let Some(labels) = labels {
            for label in labels {
                error.add_label(label);
            }
        }
        error
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Self {
        ErrorKind::Transaction {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn network_timeout(message: impl Into<String>) -> Self {
        ErrorKind::NetworkTimeout {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error is an "ns not found" error or not.
    pub fn is_ns_not_found(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(ref err) if err.code == 26)
    }

    /// Whether this error originated from a network issue (including a network timeout).
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::NetworkTimeout { .. }
        )
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.code_and_message() {
            Some((code, message)) => {
                if RETRYABLE_READ_CODES.contains(&code) {
                    return true;
                }
                if is_not_primary(code, message) || is_recovering(code, message) {
                    return true;
                }
                false
            }
            None => false,
        }
    }

    /// Whether a write operation should be retried if this error occurs. Only errors that the
    /// server (or this core, for network errors) has explicitly labeled are write-retryable.
    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether a "RetryableWriteError" label should be added to this error. If max_wire_version
    /// indicates a 4.4+ server, a label should only be added if the error is a network error.
    /// Otherwise, a label should be added if the error is a network error or the error code
    /// matches one of the retryable write codes.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.code_and_message() {
            Some((code, _)) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether the server signaled overload while also marking the failed attempt as safe to
    /// retry. Retries of these errors are throttled by the topology's retry budget.
    pub(crate) fn is_retryable_overload(&self) -> bool {
        self.contains_label(SYSTEM_OVERLOADED_ERROR) && self.contains_label(RETRYABLE_ERROR)
    }

    /// Whether this error corresponds to the server exceeding an operation's `maxTimeMS`.
    pub fn is_max_time_ms_expired_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(ref err) if err.code == 50)
    }

    /// Whether this error is the fixed server response to a retryable write attempted against a
    /// deployment that does not support retryable writes.
    pub(crate) fn is_incompatible_retryability_error(&self) -> bool {
        match self.code_and_message() {
            Some((20, message)) => message.starts_with("Transaction numbers"),
            _ => false,
        }
    }

    /// The server-reported error code, if this is a server error.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => Some(err.code),
            _ => None,
        }
    }

    fn code_and_message(&self) -> Option<(i32, &str)> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some((err.code, err.message.as_str())),
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => {
                Some((err.code, err.message.as_str()))
            }
            _ => None,
        }
    }

    /// The write concern error attached to this error, if any.
    pub(crate) fn write_concern_error(&self) -> Option<&WriteConcernError> {
        match self.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => Some(err),
            _ => None,
        }
    }

    /// Whether a commit that failed with this error may nonetheless have taken effect server
    /// side. Such errors are decorated with the [`UNKNOWN_TRANSACTION_COMMIT_RESULT`] label.
    pub(crate) fn is_unknown_commit(&self) -> bool {
        if let Some(wc_error) = self.write_concern_error() {
            if UNKNOWN_COMMIT_EXCLUDED_CODE_NAMES.contains(&wc_error.code_name.as_str()) {
                return false;
            }
        }
        self.is_write_retryable()
            || self.write_concern_error().is_some()
            || self.is_max_time_ms_expired_error()
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    /// Returns a copy of this error with the specified label added.
    pub(crate) fn with_label<T: AsRef<str>>(mut self, label: T) -> Self {
        self.add_label(label);
        self
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self {
            kind: Box::new(err.into()),
            labels: Default::default(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(crate::bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(crate::bson::ser::Error),

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred during a write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// The client was misused in a way related to transactions.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// No server was available for an operation within the server selection timeout.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The selected server is incompatible with the requested behavior.
    #[error("{message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A network operation exceeded its time budget.
    #[error("{message}")]
    #[non_exhaustive]
    NetworkTimeout { message: String },

    /// The client was used after [`Client::shutdown`](crate::Client::shutdown) was called.
    #[error("the client was shut down and can no longer be used")]
    Shutdown,

    /// An internal error occurred. These errors signal a defect in the driver rather than an
    /// operational condition and are never retried.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

impl From<crate::bson::de::Error> for ErrorKind {
    fn from(err: crate::bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<crate::bson::ser::Error> for ErrorKind {
    fn from(err: crate::bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

/// An error that was returned from the server as a response to a command.
#[derive(Clone, Debug, Deserialize, ThisError)]
#[error("Command failed ({code_name}): {message}")]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, ThisError)]
#[error("Write concern error ({code_name}): {message}")]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// An error that occurred during a write operation that wasn't due to being unable to satisfy a
/// write concern.
#[derive(Clone, Debug, Deserialize, ThisError)]
#[error("Write error ({code}): {message}")]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// The set of errors that can occur during a write.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    /// An error due to not being able to satisfy a write concern.
    WriteConcernError(WriteConcernError),

    /// An error reported for an individual write.
    WriteError(WriteError),
}

fn is_not_primary(code: i32, message: &str) -> bool {
    if NOT_PRIMARY_CODES.contains(&code) {
        return true;
    }
    // Older servers are only identifiable by the error message.
    message.contains("not master")
}

fn is_recovering(code: i32, message: &str) -> bool {
    if RECOVERING_CODES.contains(&code) || SHUTTING_DOWN_CODES.contains(&code) {
        return true;
    }
    message.contains("not master or secondary") || message.contains("node is recovering")
}

#[cfg(test)]
mod test {
    use super::*;

    fn command_error(code: i32, message: &str) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: message.to_string(),
        })
        .into()
    }

    #[test]
    fn read_retryability_uses_code_tables() {
        assert!(command_error(11600, "interrupted at shutdown").is_read_retryable());
        assert!(command_error(1234, "not master").is_read_retryable());
        assert!(!command_error(8000, "some other failure").is_read_retryable());
    }

    #[test]
    fn write_retryability_requires_label() {
        let plain = command_error(11600, "interrupted at shutdown");
        assert!(!plain.is_write_retryable());
        let labeled = plain.with_label(RETRYABLE_WRITE_ERROR);
        assert!(labeled.is_write_retryable());
    }

    #[test]
    fn retryable_write_label_depends_on_wire_version() {
        let err = command_error(11600, "interrupted at shutdown");
        assert!(err.should_add_retryable_write_label(8));
        assert!(!err.should_add_retryable_write_label(9));

        let network: Error = ErrorKind::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
        .into();
        assert!(network.should_add_retryable_write_label(9));
    }

    #[test]
    fn overload_requires_both_labels() {
        let err = command_error(462, "overloaded").with_label(SYSTEM_OVERLOADED_ERROR);
        assert!(!err.is_retryable_overload());
        let err = err.with_label(RETRYABLE_ERROR);
        assert!(err.is_retryable_overload());
    }

    #[test]
    fn unknown_commit_excludes_unsatisfiable_write_concerns() {
        let wc_err = |code_name: &str| -> Error {
            ErrorKind::Write(WriteFailure::WriteConcernError(WriteConcernError {
                code: 100,
                code_name: code_name.to_string(),
                message: "write concern failure".to_string(),
            }))
            .into()
        };
        assert!(wc_err("WriteConcernTimeout").is_unknown_commit());
        assert!(!wc_err("UnsatisfiableWriteConcern").is_unknown_commit());
        assert!(!wc_err("UnknownReplWriteConcern").is_unknown_commit());
    }
}
