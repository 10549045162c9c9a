use std::time::Duration;

use crate::{
    bson::{doc, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    error::Result,
    operation::{
        append_options,
        remove_empty_write_concern,
        OperationCategory,
        OperationWithDefaults,
        Retryability,
        WriteConcernOnlyBody,
    },
    options::TransactionOptions,
};

/// The `commitTransaction` command. Construction happens in
/// [`ClientSession::commit_transaction`](crate::ClientSession::commit_transaction); the executor
/// drives its single retry through [`update_for_retry`](OperationWithDefaults::update_for_retry).
pub struct CommitTransaction {
    options: Option<TransactionOptions>,
    recovery_token: Option<Document>,
}

impl CommitTransaction {
    pub(crate) fn new(
        options: Option<TransactionOptions>,
        recovery_token: Option<Document>,
    ) -> Self {
        Self {
            options,
            recovery_token,
        }
    }
}

impl OperationWithDefaults for CommitTransaction {
    type O = ();

    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };

        remove_empty_write_concern!(self.options);
        if let Some(ref options) = self.options {
            append_options(
                &mut body,
                Some(&CommitOptionsBody {
                    write_concern: options.write_concern.as_ref(),
                    max_commit_time: options.max_commit_time,
                }),
            )?;
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

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|opts| opts.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    // Updates the write concern to use w: majority and a wtimeout of 10000 if one is not already
    // set. The write concern on a commitTransaction command should be updated if a commit is
    // being retried internally or by the user.
    fn update_for_retry(&mut self) {
        let options = self
            .options
            .get_or_insert_with(|| TransactionOptions::builder().build());
        match &mut options.write_concern {
            Some(write_concern) => {
                write_concern.w = Some(Acknowledgment::Majority);
                if write_concern.w_timeout.is_none() {
                    write_concern.w_timeout = Some(Duration::from_millis(10000));
                }
            }
            None => {
                options.write_concern = Some(
                    WriteConcern::builder()
                        .w(Acknowledgment::Majority)
                        .w_timeout(Duration::from_millis(10000))
                        .build(),
                );
            }
        }
    }

    // A commit is retried at most once, with the write concern upgraded to majority.
    fn max_attempts(&self) -> Option<u32> {
        Some(2)
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitOptionsBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    write_concern: Option<&'a WriteConcern>,

    #[serde(
        rename = "maxTimeMS",
        serialize_with = "crate::serde_util::serialize_duration_option_as_int_millis",
        skip_serializing_if = "Option::is_none"
    )]
    max_commit_time: Option<std::time::Duration>,
}
