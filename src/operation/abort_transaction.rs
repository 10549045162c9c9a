use crate::{
    bson::{self, doc, Document},
    client::session::TransactionPin,
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    operation::{OperationCategory, OperationWithDefaults, Retryability, WriteConcernOnlyBody},
    selection_criteria::SelectionCriteria,
};

/// The `abortTransaction` command. Best-effort cleanup: the session swallows nearly every error
/// this operation surfaces.
pub struct AbortTransaction {
    write_concern: Option<WriteConcern>,
    pinned: Option<TransactionPin>,
    recovery_token: Option<Document>,
}

impl AbortTransaction {
    pub(crate) fn new(
        write_concern: Option<WriteConcern>,
        pinned: Option<TransactionPin>,
        recovery_token: Option<Document>,
    ) -> Self {
        Self {
            write_concern,
            pinned,
            recovery_token,
        }
    }
}

impl OperationWithDefaults for AbortTransaction {
    type O = ();

    const NAME: &'static str = "abortTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };
        if let Some(ref write_concern) = self.write_concern() {
            if !write_concern.is_empty() {
                body.insert("writeConcern", bson::to_bson(write_concern)?);
            }
        }
        let mut command = Command::new(Self::NAME, "admin", body);
        if let Some(ref token) = self.recovery_token {
            command.set_recovery_token(token);
        }

        Ok(command)
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteConcernOnlyBody = response.body()?;
        response.validate()
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        match &self.pinned {
            Some(TransactionPin::Mongos(s)) => Some(s),
            None => None,
        }
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    fn update_for_retry(&mut self) {
        // The abort will be retried against a newly selected server, so a mongos pin no longer
        // applies.
        self.pinned = None;
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(2)
    }
}
