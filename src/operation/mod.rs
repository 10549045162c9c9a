//! The abstraction layer between an individual command and the execution core. Each server-side
//! command is modeled as an [`Operation`]; the executor consumes the operation's category and
//! capability accessors to decide selection and retry policy, and delegates response decoding and
//! error mapping back to the operation.

mod abort_transaction;
mod commit_transaction;
mod run_command;

#[cfg(test)]
mod test;

use std::{collections::HashSet, fmt::Debug, sync::LazyLock};

use serde::{Deserialize, Serialize};

use crate::{
    bson::{self, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, ErrorKind, Result, WriteConcernError, WriteFailure},
    concern::WriteConcern,
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
};

pub use abort_transaction::AbortTransaction;
pub use commit_transaction::CommitTransaction;
pub use run_command::RunCommand;

pub(crate) static SESSIONS_UNSUPPORTED_COMMANDS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| {
        ["killcursors", "parallelcollectionscan"]
            .into_iter()
            .collect()
    });

/// A trait modeling the behavior of a server-side operation.
///
/// No methods in this trait have default behaviors, to ensure that wrapper operations replicate
/// all behavior. Default behavior is provided by the [`OperationWithDefaults`] trait.
pub trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server-side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation. The
    /// operation may store some additional state that is required for handling the response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: CommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interprets an error encountered while sending the built command to the server,
    /// potentially recovering. A recovery here is final and not subject to further retry.
    fn handle_error(&self, error: Error) -> Result<Self::O>;

    /// The category of this operation, carrying its selection and retry policy.
    fn category(&self) -> OperationCategory;

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria>;

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool;

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern>;

    /// Returns whether or not this command supports the `readConcern` field.
    fn supports_read_concern(&self, description: &StreamDescription) -> bool;

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool;

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability;

    /// Updates this operation as needed for a retry. Batched writers reset their batch cursor
    /// here so that a retry resends the failed batch rather than building the next one.
    fn update_for_retry(&mut self);

    /// An explicit override of the executor's attempt budget for this operation.
    fn max_attempts(&self) -> Option<u32>;

    /// The name of the command this operation sends.
    fn name(&self) -> &str;
}

/// The closed set of operation categories. Each category implies a selection and retry policy:
/// cursor continuation commands are routed to the server that created the cursor, ad-hoc
/// commands are never retried outside the overload path, and batched writes defer entirely to
/// their own idempotency flag.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum OperationCategory {
    /// A read command, possibly creating a cursor. Aggregations with an embedded write stage
    /// ($out/$merge) set `write_stage` so selection only considers servers able to execute
    /// writes.
    Read {
        /// Whether the pipeline contains a write stage.
        write_stage: bool,
    },

    /// A single write command.
    Write,

    /// A cursor continuation command, routed to the cursor's server.
    GetMore {
        /// The address of the server the cursor was created on.
        address: ServerAddress,
    },

    /// A cursor cleanup command, routed to the cursor's server.
    KillCursors {
        /// The address of the server the cursor was created on.
        address: ServerAddress,
    },

    /// An ad-hoc user command (`runCommand`).
    RunCommand,

    /// A write command that sends its payload in batches.
    BatchedWrite,
}

impl OperationCategory {
    /// Whether a successful execution of this operation creates a server-side cursor.
    pub(crate) fn creates_cursor(&self) -> bool {
        matches!(self, OperationCategory::Read { .. })
    }
}

/// The level of retryability an operation supports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Retryability {
    /// The operation is a retryable write.
    Write,
    /// The operation is a retryable read.
    Read,
    /// The operation cannot be retried.
    None,
}

/// Appends a serializable struct to the input document. The serializable struct MUST serialize to
/// a Document; otherwise, an error will be thrown.
pub(crate) fn append_options<T: Serialize + Debug>(
    doc: &mut Document,
    options: Option<&T>,
) -> Result<()> {
    if let Some(options) = options {
        let options_doc = bson::to_document(options)?;
        doc.extend(options_doc);
    }
    Ok(())
}

/// Body of a write response that could possibly have a write concern error but not write errors.
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct WriteConcernOnlyBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl WriteConcernOnlyBody {
    pub(crate) fn validate(&self) -> Result<()> {
        match self.write_concern_error {
            Some(ref wc_error) => Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(wc_error.clone())),
                self.labels.clone(),
            )),
            None => Ok(()),
        }
    }
}

macro_rules! remove_empty_write_concern {
    ($opts:expr) => {
        if let Some(ref mut options) = $opts {
            if let Some(ref write_concern) = options.write_concern {
                if write_concern.is_empty() {
                    options.write_concern = None;
                }
            }
        }
    };
}

pub(crate) use remove_empty_write_concern;

/// A mirror of the [`Operation`] trait, with default behavior where appropriate. Should only be
/// implemented by operation types that do not delegate to other operations.
pub trait OperationWithDefaults {
    /// The output type of this operation.
    type O;

    /// The name of the server-side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: CommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interprets an error encountered while sending the built command to the server,
    /// potentially recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// The category of this operation.
    fn category(&self) -> OperationCategory;

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Returns whether or not this command supports the `readConcern` field.
    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        false
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        !SESSIONS_UNSUPPORTED_COMMANDS.contains(Self::NAME.to_lowercase().as_str())
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// An explicit override of the executor's attempt budget for this operation.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// The name of the command this operation sends.
    fn name(&self) -> &str {
        Self::NAME
    }
}

impl<T: OperationWithDefaults> Operation for T {
    type O = T::O;
    const NAME: &'static str = T::NAME;
    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.build(description)
    }
    fn handle_response(
        &self,
        response: CommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        self.handle_response(response, description)
    }
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        self.handle_error(error)
    }
    fn category(&self) -> OperationCategory {
        self.category()
    }
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria()
    }
    fn is_acknowledged(&self) -> bool {
        self.is_acknowledged()
    }
    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern()
    }
    fn supports_read_concern(&self, description: &StreamDescription) -> bool {
        self.supports_read_concern(description)
    }
    fn supports_sessions(&self) -> bool {
        self.supports_sessions()
    }
    fn retryability(&self) -> Retryability {
        self.retryability()
    }
    fn update_for_retry(&mut self) {
        self.update_for_retry()
    }
    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts()
    }
    fn name(&self) -> &str {
        self.name()
    }
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}
