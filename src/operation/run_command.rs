use crate::{
    bson::Document,
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{first_key, OperationCategory, OperationWithDefaults, Retryability},
    selection_criteria::SelectionCriteria,
};

use super::SESSIONS_UNSUPPORTED_COMMANDS;

/// An ad-hoc user command. Never retried by the executor except through the overload path.
#[derive(Debug)]
pub struct RunCommand {
    target_db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    /// Creates an operation running `command` against `target_db`.
    pub fn new(
        target_db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if first_key(&command).is_none() {
            return Err(Error::invalid_argument(
                "an empty document cannot be run as a command",
            ));
        }
        Ok(Self {
            target_db: target_db.into(),
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        // Validated to be non-empty at construction.
        first_key(&self.command).unwrap_or("")
    }
}

impl OperationWithDefaults for RunCommand {
    type O = Document;

    const NAME: &'static str = "runCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name().to_string(),
            self.target_db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(response.raw().clone())
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::RunCommand
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_sessions(&self) -> bool {
        !SESSIONS_UNSUPPORTED_COMMANDS.contains(self.command_name().to_lowercase().as_str())
    }

    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}
