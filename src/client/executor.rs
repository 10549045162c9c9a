//! The operation executor: the top-level entry point through which every command reaches a
//! server. For each logical operation it provisions a session, derives a deadline, selects a
//! server, and drives the retry loop.

use std::{sync::Arc, time::Duration};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::{
    client::session::TransactionState,
    cmap::{Command, StreamDescription},
    concern::{ReadConcernInternal, ReadConcernLevel},
    error::{
        Error,
        ErrorKind,
        Result,
        NO_WRITES_PERFORMED,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
    },
    operation::{Operation, OperationCategory, Retryability},
    options::ServerAddress,
    retry_budget::{BUDGET_REFRESH, RETRY_COST},
    sdam::{SelectionContext, Server, ServerInfo, ServerType},
    selection_criteria::{ReadPreference, SelectionCriteria},
    timeout::TimeoutContext,
    Client,
    ClientSession,
};

/// The widened attempt limit applied once an overloaded server asks for backoff. Under a
/// client-side deadline the limit stays unbounded; the deadline governs instead.
const MAX_OVERLOAD_ATTEMPTS: u32 = 6;

/// Caps the unjittered overload backoff.
const MAX_OVERLOAD_BACKOFF: Duration = Duration::from_millis(10_000);

impl Client {
    /// Executes `operation`, retrying on failure as the operation's category, the topology's
    /// retry configuration, and the active deadline allow.
    ///
    /// When no session is provided and the operation supports sessions, an implicit session is
    /// checked out for the duration of the call and returned to the pool on completion.
    pub async fn execute_operation<T: Operation>(
        &self,
        operation: T,
        session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        self.ensure_connected()?;

        let mut implicit_session = None;
        let session: Option<&mut ClientSession> = match session {
            Some(session) => {
                if !self.is_session_owner(session) {
                    return Err(Error::invalid_argument(
                        "the session provided to an operation must be created from the client \
                         the operation is executed on",
                    ));
                }
                if !operation.supports_sessions() {
                    return Err(Error::invalid_argument(format!(
                        "{} does not support sessions",
                        operation.name()
                    )));
                }
                if !operation.is_acknowledged() {
                    return Err(Error::invalid_argument(
                        "Cannot use ClientSessions with unacknowledged write concerns",
                    ));
                }
                if session.is_snapshot() {
                    if let Some(wire_version) = self.inner.topology.common_wire_version() {
                        if wire_version < 13 {
                            return Err(ErrorKind::IncompatibleServer {
                                message: "Snapshot reads require MongoDB 5.0 or later".into(),
                            }
                            .into());
                        }
                    }
                }
                Some(session)
            }
            None if operation.supports_sessions() && operation.is_acknowledged() => {
                implicit_session = Some(self.start_implicit_session().await);
                implicit_session.as_mut()
            }
            None => None,
        };

        if let Some(ref session) = session {
            if session.in_transaction() && !transaction_read_pref_ok(&operation, session) {
                return Err(Error::transaction(
                    "read preference in a transaction must be primary",
                ));
            }
        }

        // Transaction commit/abort nested inside `with_transaction` share the session-level
        // deadline; everything else gets a fresh one.
        let deadline = match session.as_ref().and_then(|s| s.timeout_context.clone()) {
            Some(deadline) => deadline,
            None => TimeoutContext::from_options(self.options()),
        };

        self.execute_operation_with_retry(operation, session, deadline)
            .await
    }

    async fn execute_operation_with_retry<T: Operation>(
        &self,
        mut operation: T,
        mut session: Option<&mut ClientSession>,
        mut deadline: TimeoutContext,
    ) -> Result<T::O> {
        let mut attempt: u32 = 0;
        let mut max_attempts: u32 = 1;
        let mut txn_number: Option<u64> = None;
        let mut retained_error: Option<Error> = None;
        let mut deprioritized: Vec<ServerAddress> = Vec::new();
        let mut widened_for_overload = false;
        // Whether the upcoming attempt is a retry of a write-classified (non-overload) failure,
        // in which case the newly selected server must itself support retryable writes.
        let mut retrying_write = false;
        let mut rng = SmallRng::from_os_rng();

        loop {
            let criteria = self.effective_criteria(&operation, session.as_deref());
            let selection_timeout = deadline.server_selection_timeout();
            let context = SelectionContext {
                operation_name: operation.name(),
                deprioritized: &deprioritized,
                timeout: Some(selection_timeout),
            };
            let server = match self
                .inner
                .topology
                .select_server(&criteria, context)
                .await
            {
                Ok(server) => server,
                Err(error) => return Err(retained_error.unwrap_or(error)),
            };
            let description = server.description();

            if retrying_write && !description.supports_retryable_writes() {
                return Err(ErrorKind::IncompatibleServer {
                    message: "Selected server does not support retryable writes".into(),
                }
                .into());
            }

            let retryability = self.effective_retryability(&operation, session.as_deref(), &description);
            if attempt == 0 {
                max_attempts = match operation.max_attempts() {
                    Some(limit) => limit,
                    None if retryability != Retryability::None => {
                        if deadline.is_csot() {
                            u32::MAX
                        } else {
                            2
                        }
                    }
                    None => 1,
                };
                if let Some(ref mut session) = session {
                    if session.transaction.state != TransactionState::None {
                        txn_number = Some(session.txn_number());
                    } else if retryability == Retryability::Write {
                        txn_number = Some(session.get_and_increment_txn_number());
                    }
                }
            }

            let result = self
                .execute_attempt(
                    &mut operation,
                    session.as_deref_mut(),
                    txn_number,
                    &mut deadline,
                    server.as_ref(),
                    &description,
                )
                .await;
            attempt += 1;

            let error = match result {
                Ok(value) => {
                    let deposit = if attempt > 1 {
                        BUDGET_REFRESH + RETRY_COST
                    } else {
                        BUDGET_REFRESH
                    };
                    self.inner.topology.retry_budget().deposit(deposit);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_incompatible_retryability_error() {
                return Err(Error::invalid_argument(
                    "This MongoDB deployment does not support retryable writes. Please add \
                     retryWrites=false to your connection string.",
                ));
            }

            let overload = error.is_retryable_overload();
            let can_retry = overload
                || match retryability {
                    Retryability::Write => error.is_write_retryable(),
                    Retryability::Read => error.is_read_retryable(),
                    Retryability::None => false,
                };
            let is_network = error.is_network_error();
            let no_writes_performed = error.contains_label(NO_WRITES_PERFORMED);

            // Prefer the more informative terminal error: a later failure replaces the first
            // one only if the server did not mark it as having performed no writes.
            let retained = match retained_error.take() {
                None => error,
                Some(first) if no_writes_performed => first,
                Some(_) => error,
            };

            if overload && !widened_for_overload {
                widened_for_overload = true;
                max_attempts = max_attempts.max(MAX_OVERLOAD_ATTEMPTS);
            }

            if !can_retry || attempt >= max_attempts || deadline.is_expired() {
                if attempt > 1 && !overload {
                    // The completed retry sequence was not the overloaded server's fault;
                    // restore its cost.
                    self.inner.topology.retry_budget().deposit(RETRY_COST);
                }
                return Err(retained);
            }

            if overload {
                let budget = self.inner.topology.retry_budget();
                if !budget.consume(RETRY_COST) {
                    warn!(
                        command = operation.name(),
                        "retry budget exhausted; abandoning overload retry"
                    );
                    return Err(retained);
                }
                let backoff = overload_backoff(&mut rng, attempt - 1);
                if let Some(remaining) = deadline.remaining() {
                    if backoff >= remaining {
                        return Err(retained);
                    }
                }
                debug!(
                    command = operation.name(),
                    backoff_ms = backoff.as_millis() as u64,
                    "backing off before retrying overloaded server"
                );
                tokio::time::sleep(backoff).await;
            }

            warn!(
                command = operation.name(),
                attempt,
                error = %retained,
                "retrying operation"
            );

            deadline.clear_transient();
            if let Some(ref mut session) = session {
                // A network error on a cursor-creating operation invalidates the pin outside of
                // a transaction.
                if is_network
                    && operation.category().creates_cursor()
                    && !session.in_transaction()
                    && session.transaction.pinned.is_some()
                {
                    session.unpin();
                }
                // A commit retry is free to select a different mongos.
                if retryability == Retryability::Write
                    && matches!(session.transaction.state, TransactionState::Committed { .. })
                {
                    session.unpin();
                }
            }
            deprioritized.push(description.server_address.clone());
            operation.update_for_retry();
            retrying_write = retryability == Retryability::Write && !overload;
            retained_error = Some(retained);
        }
    }

    async fn execute_attempt<T: Operation>(
        &self,
        operation: &mut T,
        mut session: Option<&mut ClientSession>,
        txn_number: Option<u64>,
        deadline: &mut TimeoutContext,
        server: &dyn Server,
        description: &StreamDescription,
    ) -> Result<T::O> {
        let mut command = operation.build(description)?;
        self.decorate_command(
            &mut command,
            operation,
            session.as_deref_mut(),
            txn_number,
            deadline,
            description,
        )?;

        let response = match deadline.socket_budget() {
            Some(budget) => match tokio::time::timeout(budget, server.run_command(command)).await
            {
                Ok(response) => response,
                Err(_) => Err(deadline.expiry_error()),
            },
            None => server.run_command(command).await,
        };

        match response {
            Ok(response) => {
                if let Some(ref mut session) = session {
                    session.update_last_use();
                    if let Some(cluster_time) = response.cluster_time() {
                        session.advance_cluster_time(cluster_time);
                    }
                    if let Some(operation_time) = response.operation_time() {
                        session.advance_operation_time(operation_time);
                    }
                    if session.is_snapshot() && session.snapshot_time.is_none() {
                        session.snapshot_time = response.at_cluster_time();
                    }
                    if session.transaction.state != TransactionState::None {
                        if let Some(token) = response.recovery_token() {
                            session.transaction.recovery_token = Some(token);
                        }
                    }
                }

                if !response.is_success() {
                    let error =
                        stamp_labels(response.command_error(), operation, session.as_deref(), description);
                    return operation.handle_error(error);
                }

                if let Some(ref mut session) = session {
                    if session.transaction.state == TransactionState::Starting {
                        session.transaction.state = TransactionState::InProgress;
                        if description.initial_server_type == ServerType::Mongos
                            && !self.inner.topology.load_balanced()
                        {
                            session.pin_mongos(description.server_address.clone());
                        }
                    }
                }

                operation
                    .handle_response(response, description)
                    .map_err(|error| stamp_labels(error, operation, session.as_deref(), description))
            }
            Err(error) => {
                if let Some(ref mut session) = session {
                    session.mark_dirty();
                }
                Err(stamp_labels(error, operation, session.as_deref(), description))
            }
        }
    }

    /// Stamps the command with session, transaction, causal consistency, and deadline metadata.
    fn decorate_command<T: Operation>(
        &self,
        command: &mut Command,
        operation: &T,
        session: Option<&mut ClientSession>,
        txn_number: Option<u64>,
        deadline: &mut TimeoutContext,
        description: &StreamDescription,
    ) -> Result<()> {
        if let Some(session) = session {
            if description.supports_sessions() {
                command.set_session_id(session.id());
                if let Some(cluster_time) = session.cluster_time() {
                    command.set_cluster_time(cluster_time);
                }
            }

            match session.transaction.state {
                TransactionState::Starting => {
                    command.set_start_transaction();
                    command.set_autocommit();
                    if let Some(txn_number) = txn_number {
                        command.set_txn_number(txn_number);
                    }
                    let read_concern = ReadConcernInternal {
                        level: session
                            .transaction
                            .options
                            .as_ref()
                            .and_then(|options| options.read_concern.as_ref())
                            .map(|rc| rc.level.clone()),
                        at_cluster_time: None,
                        after_cluster_time: session
                            .causal_consistency()
                            .then_some(session.operation_time)
                            .flatten(),
                    };
                    command.set_read_concern(&read_concern)?;
                }
                TransactionState::InProgress
                | TransactionState::Committed { .. }
                | TransactionState::Aborted => {
                    command.set_autocommit();
                    if let Some(txn_number) = txn_number {
                        command.set_txn_number(txn_number);
                    }
                }
                TransactionState::None => {
                    if let Some(txn_number) = txn_number {
                        command.set_txn_number(txn_number);
                    }
                    if operation.supports_read_concern(description) {
                        if session.is_snapshot() {
                            let read_concern = ReadConcernInternal {
                                level: Some(ReadConcernLevel::Snapshot),
                                at_cluster_time: session.snapshot_time,
                                after_cluster_time: None,
                            };
                            command.set_read_concern(&read_concern)?;
                        } else if session.causal_consistency() {
                            let read_concern = ReadConcernInternal {
                                level: self
                                    .inner
                                    .options
                                    .read_concern
                                    .as_ref()
                                    .map(|rc| rc.level.clone()),
                                at_cluster_time: None,
                                after_cluster_time: session.operation_time,
                            };
                            command.set_read_concern(&read_concern)?;
                        }
                    }
                }
            }
        }

        // killCursors runs during cleanup, possibly after the deadline that doomed the cursor
        // has already expired.
        if !matches!(operation.category(), OperationCategory::KillCursors { .. }) {
            if let Some(max_time) = deadline.max_time_ms() {
                command.set_max_time_ms(max_time);
            }
        }

        Ok(())
    }

    fn effective_criteria<T: Operation>(
        &self,
        operation: &T,
        session: Option<&ClientSession>,
    ) -> SelectionCriteria {
        match operation.category() {
            OperationCategory::GetMore { address } | OperationCategory::KillCursors { address } => {
                // Cursor continuation must reach the server holding the cursor; going through
                // selection still gives the monitor a chance to fail fast on an unhealthy one.
                return SelectionCriteria::from_address(address);
            }
            category => {
                if let Some(session) = session {
                    if session.transaction.state != TransactionState::None {
                        if let Some(pinned) = session.transaction.pinned_mongos() {
                            return pinned.clone();
                        }
                        if let Some(criteria) = session
                            .transaction
                            .options
                            .as_ref()
                            .and_then(|options| options.selection_criteria.as_ref())
                        {
                            return criteria.clone();
                        }
                    }
                }
                let base = operation
                    .selection_criteria()
                    .or(self.inner.options.selection_criteria.as_ref())
                    .cloned()
                    .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));
                if matches!(category, OperationCategory::Read { write_stage: true })
                    && base
                        .as_read_pref()
                        .map_or(false, ReadPreference::is_secondary_eligible)
                {
                    return write_stage_criteria();
                }
                base
            }
        }
    }

    fn effective_retryability<T: Operation>(
        &self,
        operation: &T,
        session: Option<&ClientSession>,
        description: &StreamDescription,
    ) -> Retryability {
        if session.map_or(false, ClientSession::in_transaction) {
            return Retryability::None;
        }
        match operation.retryability() {
            Retryability::Write
                if self.inner.options.retry_writes != Some(false)
                    && description.supports_retryable_writes() =>
            {
                Retryability::Write
            }
            Retryability::Read if self.inner.options.retry_reads != Some(false) => {
                Retryability::Read
            }
            _ => Retryability::None,
        }
    }
}

/// Attaches the client-side retry and transaction labels the server cannot know about: the
/// retryable-write label (server-side codes only below wire version 9, network errors always)
/// and the transient-transaction label for network errors inside a transaction. Individual
/// statements of an active transaction only ever get the transient label; the commit and abort
/// commands that end it are labeled as retryable writes again.
fn stamp_labels<T: Operation>(
    mut error: Error,
    operation: &T,
    session: Option<&ClientSession>,
    description: &StreamDescription,
) -> Error {
    let in_transaction = session.map_or(false, ClientSession::in_transaction);
    if !in_transaction
        && operation.retryability() == Retryability::Write
        && description.supports_retryable_writes()
    {
        if let Some(wire_version) = description.max_wire_version {
            if error.should_add_retryable_write_label(wire_version) {
                error.add_label(RETRYABLE_WRITE_ERROR);
            }
        }
    }
    if in_transaction && error.is_network_error() {
        error.add_label(TRANSIENT_TRANSACTION_ERROR);
    }
    error
}

/// Whether the operation's effective read preference is legal inside a transaction.
fn transaction_read_pref_ok<T: Operation>(operation: &T, session: &ClientSession) -> bool {
    if !matches!(
        operation.category(),
        OperationCategory::Read { .. } | OperationCategory::RunCommand
    ) {
        return true;
    }
    let criteria = session
        .transaction
        .options
        .as_ref()
        .and_then(|options| options.selection_criteria.as_ref())
        .or_else(|| operation.selection_criteria());
    match criteria.and_then(SelectionCriteria::as_read_pref) {
        Some(read_pref) => !read_pref.is_secondary_eligible(),
        None => true,
    }
}

/// A selector for aggregations with an embedded write stage ($out/$merge): secondaries are only
/// eligible once they can execute the write stage themselves (wire version 13, server 5.0).
fn write_stage_criteria() -> SelectionCriteria {
    SelectionCriteria::Predicate(Arc::new(|info: &ServerInfo| match info.server_type {
        ServerType::RsSecondary => info.max_wire_version.map_or(false, |v| v >= 13),
        other => other.is_data_bearing(),
    }))
}

/// The jittered backoff preceding a retry of the 0-indexed `failed_attempt` against an
/// overloaded server.
fn overload_backoff(rng: &mut SmallRng, failed_attempt: u32) -> Duration {
    let cap = Duration::from_millis(100 << failed_attempt.min(7)).min(MAX_OVERLOAD_BACKOFF);
    cap.mul_f64(rng.random::<f64>())
}
