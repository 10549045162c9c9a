mod cluster_time;
mod pool;

use std::time::{Duration, Instant};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    error::{
        ErrorKind,
        Result,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    operation::{AbortTransaction, CommitTransaction, Operation},
    options::{ServerAddress, SessionOptions, TransactionOptions},
    sdam::TransactionSupportStatus,
    selection_criteria::SelectionCriteria,
    timeout::TimeoutContext,
    BoxFuture,
    Client,
};

pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// The wall-clock limit on one `with_transaction` call, covering all of its internal retries.
const WITH_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations. To create a `ClientSession`, call `start_session` on a `Client`.
///
/// `ClientSession` instances are not thread safe or fork safe. They can only be used by one
/// thread or process at a time.
///
/// ## Transactions
/// Transactions are used to execute a series of operations across multiple documents and
/// collections atomically. Transactions are associated with a `ClientSession`. To begin a
/// transaction, call [`ClientSession::start_transaction`] on a `ClientSession`. The
/// `ClientSession` must be passed to each operation executed within the transaction.
///
/// A "TransientTransactionError" label on an error indicates that the entire transaction can be
/// retried with a reasonable expectation that it will succeed. An "UnknownTransactionCommitResult"
/// label indicates that it is unknown whether the commit has satisfied the write concern
/// associated with the transaction; it is safe to retry the commit until the write concern is
/// satisfied or an error without the label is returned. [`ClientSession::with_transaction`]
/// handles both retry loops automatically.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: ServerSession,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub(crate) transaction: Transaction,
    pub(crate) snapshot_time: Option<Timestamp>,
    pub(crate) operation_time: Option<Timestamp>,
    /// The deadline context shared by every statement of an in-flight `with_transaction` call.
    /// `None` outside of one; each top-level operation then derives its own context.
    pub(crate) timeout_context: Option<TimeoutContext>,
    #[cfg(test)]
    pub(crate) convenient_transaction_timeout: Option<Duration>,
}

#[derive(Debug)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) pinned: Option<TransactionPin>,
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.recovery_token = None;
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned = None;
    }

    pub(crate) fn pinned_mongos(&self) -> Option<&SelectionCriteria> {
        match &self.pinned {
            Some(TransactionPin::Mongos(s)) => Some(s),
            None => None,
        }
    }

    fn take(&mut self) -> Self {
        Transaction {
            state: self.state.clone(),
            options: self.options.take(),
            pinned: self.pinned.take(),
            recovery_token: self.recovery_token.take(),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            state: TransactionState::None,
            options: None,
            pinned: None,
            recovery_token: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any data was committed when commit_transaction was initially called. This is
        /// required to determine whether a commitTransaction command should be run if the user
        /// calls commit_transaction again.
        data_committed: bool,
    },
    Aborted,
}

#[derive(Debug)]
pub(crate) enum TransactionPin {
    Mongos(SelectionCriteria),
}

impl ClientSession {
    /// Creates a new `ClientSession` by checking out a corresponding `ServerSession` from the
    /// provided client's session pool.
    pub(crate) async fn new(
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        let timeout = client.inner.topology.logical_session_timeout();
        let server_session = client.inner.session_pool.check_out(timeout).await;
        Self {
            client,
            server_session,
            cluster_time: None,
            is_implicit,
            options,
            transaction: Default::default(),
            snapshot_time: None,
            operation_time: None,
            timeout_context: None,
            #[cfg(test)]
            convenient_transaction_timeout: None,
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    /// Whether this session was created implicitly by the driver or explicitly by the user.
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether this session is configured for snapshot reads.
    pub(crate) fn is_snapshot(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|opts| opts.snapshot)
            .unwrap_or(false)
    }

    /// Whether this session is currently in a transaction.
    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.state == TransactionState::Starting
            || self.transaction.state == TransactionState::InProgress
    }

    /// The highest seen cluster time this session has seen so far.
    /// This will be `None` if this session has not been used in an operation yet.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The options used to create this session.
    pub(crate) fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest seen
    /// cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance operation time for this session. If the provided timestamp is earlier than this
    /// session's current operation time, then the operation time is unchanged.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        self.operation_time = match self.operation_time {
            Some(current_op_time) if current_op_time < ts => Some(ts),
            None => Some(ts),
            _ => self.operation_time,
        }
    }

    /// The operation time returned by the last operation executed in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    pub(crate) fn causal_consistency(&self) -> bool {
        if self.is_snapshot() {
            return false;
        }
        self.options()
            .and_then(|opts| opts.causal_consistency)
            .unwrap_or(!self.is_implicit())
    }

    /// Mark this session (and the underlying server session) as dirty.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    /// Updates the date that the underlying server session was last used as part of an operation
    /// sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    /// Gets the current txn_number.
    pub(crate) fn txn_number(&self) -> u64 {
        self.server_session.txn_number
    }

    /// Increments the txn_number.
    pub(crate) fn increment_txn_number(&mut self) {
        self.server_session.txn_number += 1;
    }

    /// Increments the txn_number and returns the new value.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> u64 {
        self.increment_txn_number();
        self.server_session.txn_number
    }

    /// Pin the session to the mongos it first executed a transaction statement against.
    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.transaction.pinned = Some(TransactionPin::Mongos(SelectionCriteria::from_address(
            address,
        )));
    }

    pub(crate) fn unpin(&mut self) {
        self.transaction.pinned = None;
    }

    /// Whether this session is dirty.
    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    #[cfg(test)]
    pub(crate) fn age_server_session(&mut self, by: Duration) {
        self.server_session.last_use -= by;
    }

    fn default_transaction_options(&self) -> Option<&TransactionOptions> {
        self.options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref())
    }

    /// Starts a new transaction on this session with the given options. If no options are
    /// provided, the session's `default_transaction_options` will be used, falling back to the
    /// client's read and write concern for fields left unset. This session must be passed into
    /// each operation within the transaction; otherwise, the operation will be executed outside
    /// of the transaction.
    ///
    /// Errors returned from operations executed within a transaction may include a
    /// "TransientTransactionError" label, indicating that the entire transaction can be retried
    /// with a reasonable expectation that it will succeed.
    pub async fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        if self.is_snapshot() {
            return Err(ErrorKind::Transaction {
                message: "Transactions are not supported in snapshot sessions".into(),
            }
            .into());
        }
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".into(),
                }
                .into());
            }
            TransactionState::Committed { .. } => {
                self.unpin(); // Unpin session if previous transaction is committed.
            }
            _ => {}
        }
        match self.client.transaction_support_status() {
            TransactionSupportStatus::Supported => {
                let mut options = match options.into() {
                    Some(mut options) => {
                        if let Some(defaults) = self.default_transaction_options() {
                            if options.read_concern.is_none() {
                                options.read_concern = defaults.read_concern.clone();
                            }
                            if options.write_concern.is_none() {
                                options.write_concern = defaults.write_concern.clone();
                            }
                            if options.selection_criteria.is_none() {
                                options.selection_criteria = defaults.selection_criteria.clone();
                            }
                            if options.max_commit_time.is_none() {
                                options.max_commit_time = defaults.max_commit_time;
                            }
                        }
                        Some(options)
                    }
                    None => self.default_transaction_options().cloned(),
                };

                let inherited = self.client.options();
                if inherited.read_concern.is_some()
                    || inherited.write_concern.is_some()
                    || inherited.selection_criteria.is_some()
                {
                    let options = options.get_or_insert_with(Default::default);
                    if options.read_concern.is_none() {
                        options.read_concern = inherited.read_concern.clone();
                    }
                    if options.write_concern.is_none() {
                        options.write_concern = inherited.write_concern.clone();
                    }
                    if options.selection_criteria.is_none() {
                        options.selection_criteria = inherited.selection_criteria.clone();
                    }
                }

                if let Some(write_concern) =
                    options.as_ref().and_then(|options| options.write_concern.as_ref())
                {
                    write_concern.validate()?;
                    if !write_concern.is_acknowledged() {
                        return Err(ErrorKind::Transaction {
                            message: "transactions do not support unacknowledged write concerns"
                                .into(),
                        }
                        .into());
                    }
                }

                self.increment_txn_number();
                self.transaction.start(options);
                Ok(())
            }
            _ => Err(ErrorKind::Transaction {
                message: "Transactions are not supported by this deployment".into(),
            }
            .into()),
        }
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// This method may return an error with an "UnknownTransactionCommitResult" label, indicating
    /// that it is unknown whether the commit has satisfied the write concern associated with the
    /// transaction. If an error with this label is returned, it is safe to retry the commit until
    /// the write concern is satisfied or an error without the label is returned.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match &mut self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction".into(),
            }
            .into()),
            TransactionState::Starting => {
                // No statement was ever run, so there is nothing to commit server-side.
                self.transaction.commit(false);
                Ok(())
            }
            TransactionState::InProgress => {
                let commit_transaction = CommitTransaction::new(
                    self.transaction.options.clone(),
                    self.transaction.recovery_token.clone(),
                );
                self.transaction.commit(true);
                self.run_commit(commit_transaction).await
            }
            TransactionState::Committed {
                data_committed: true,
            } => {
                let mut commit_transaction = CommitTransaction::new(
                    self.transaction.options.clone(),
                    self.transaction.recovery_token.clone(),
                );
                commit_transaction.update_for_retry();
                self.run_commit(commit_transaction).await
            }
            TransactionState::Committed {
                data_committed: false,
            } => Ok(()),
        }
    }

    async fn run_commit(&mut self, commit_transaction: CommitTransaction) -> Result<()> {
        let result = self
            .client
            .clone()
            .execute_operation(commit_transaction, Some(&mut *self))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(mut error) => {
                if error.is_unknown_commit() {
                    error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                    // The commit may be retried against a different server, so a mongos pin no
                    // longer applies.
                    self.unpin();
                }
                Err(error)
            }
        }
    }

    /// Aborts the transaction that is currently active on this session. Any data written as part
    /// of that transaction will be rolled back.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".into(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.abort();
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = self
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|options| options.write_concern.as_ref())
                    .cloned();
                let abort_transaction = AbortTransaction::new(
                    write_concern,
                    self.transaction.pinned.take(),
                    self.transaction.recovery_token.clone(),
                );
                self.transaction.abort();
                // The abort is best-effort cleanup; its errors are ignored unless they signal a
                // driver defect.
                let result = self
                    .client
                    .clone()
                    .execute_operation(abort_transaction, Some(&mut *self))
                    .await;
                match result {
                    Err(error) if matches!(*error.kind, ErrorKind::Internal { .. }) => Err(error),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Starts a transaction, runs the given callback, and commits or aborts the transaction.
    /// Transient transaction errors will cause the callback or the commit to be retried; other
    /// errors will cause the transaction to be aborted and the error returned to the caller.
    ///
    /// If a command inside the callback fails, it may cause the transaction on the server to be
    /// aborted. This situation is normally handled transparently by the driver. However, if the
    /// application does not return that error from the callback, the driver will not be able to
    /// determine whether the transaction was aborted or not. The driver will then retry the
    /// callback indefinitely. To avoid this situation, the application MUST NOT silently handle
    /// errors within the callback. If the application needs to handle errors within the callback,
    /// it MUST return them after doing so.
    ///
    /// Because the callback can be repeatedly executed and because it returns a future, the rust
    /// closure borrowing rules for captured values can be overly restrictive. As a convenience,
    /// `with_transaction` accepts a context argument that will be passed to the callback along
    /// with the session:
    ///
    /// ```ignore
    /// let my_data = "my data".to_string();
    /// session.with_transaction(
    ///     None,
    ///     (&coll, &my_data),
    ///     |session, (coll, my_data)| async move {
    ///         coll.insert_one_with_session(doc! { "data": *my_data }, session).await
    ///     }.boxed()
    /// ).await?;
    /// ```
    pub async fn with_transaction<R, C, F>(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
        mut context: C,
        mut callback: F,
    ) -> Result<R>
    where
        F: for<'b> FnMut(&'b mut ClientSession, &'b mut C) -> BoxFuture<'b, Result<R>>,
    {
        let options = options.into();
        let mut limit = WITH_TRANSACTION_TIMEOUT;
        #[cfg(test)]
        if let Some(test_timeout) = self.convenient_transaction_timeout {
            limit = test_timeout;
        }

        // Under CSOT all statements of the transaction share one overall deadline, carried on the
        // session so that the executor picks it up instead of deriving a fresh one per statement.
        let deadline = TimeoutContext::from_options(self.client.options());
        if deadline.is_csot() {
            if let Some(remaining) = deadline.remaining() {
                limit = limit.min(remaining);
            }
            self.timeout_context = Some(deadline);
        }

        let result = self
            .run_transaction_loop(options, limit, &mut context, &mut callback)
            .await;
        self.timeout_context = None;
        result
    }

    async fn run_transaction_loop<R, C, F>(
        &mut self,
        options: Option<TransactionOptions>,
        limit: Duration,
        context: &mut C,
        callback: &mut F,
    ) -> Result<R>
    where
        F: for<'b> FnMut(&'b mut ClientSession, &'b mut C) -> BoxFuture<'b, Result<R>>,
    {
        let start = Instant::now();
        let mut rng = SmallRng::from_os_rng();
        let mut retries = 0u32;

        'transaction: loop {
            self.start_transaction(options.clone()).await?;
            let ret = match callback(self, context).await {
                Ok(v) => v,
                Err(error) => {
                    if matches!(
                        self.transaction.state,
                        TransactionState::Starting | TransactionState::InProgress
                    ) {
                        self.abort_transaction().await?;
                    }
                    if error.contains_label(TRANSIENT_TRANSACTION_ERROR)
                        && start.elapsed() < limit
                    {
                        retries += 1;
                        tokio::time::sleep(backoff_delay(&mut rng, retries)).await;
                        continue 'transaction;
                    }
                    return Err(error);
                }
            };
            if matches!(
                self.transaction.state,
                TransactionState::None
                    | TransactionState::Aborted
                    | TransactionState::Committed { .. }
            ) {
                // The callback intentionally ended the transaction itself.
                return Ok(ret);
            }
            'commit: loop {
                match self.commit_transaction().await {
                    Ok(()) => return Ok(ret),
                    Err(error) => {
                        if error.is_max_time_ms_expired_error() || start.elapsed() >= limit {
                            return Err(error);
                        }
                        retries += 1;
                        let delay = backoff_delay(&mut rng, retries);
                        if error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
                            tokio::time::sleep(delay).await;
                            continue 'commit;
                        }
                        if error.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                            tokio::time::sleep(delay).await;
                            continue 'transaction;
                        }
                        return Err(error);
                    }
                }
            }
        }
    }
}

/// The jittered exponential delay preceding the `retry`th internal retry of `with_transaction`.
fn backoff_delay(rng: &mut SmallRng, retry: u32) -> Duration {
    let max = BACKOFF_INITIAL.as_secs_f64() * BACKOFF_MULTIPLIER.powi(retry as i32 - 1);
    let max = max.min(BACKOFF_MAX.as_secs_f64());
    Duration::from_secs_f64(max * rng.random::<f64>())
}

struct DroppedClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: ServerSession,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    transaction: Transaction,
    snapshot_time: Option<Timestamp>,
    operation_time: Option<Timestamp>,
}

impl From<DroppedClientSession> for ClientSession {
    fn from(dropped_session: DroppedClientSession) -> Self {
        Self {
            cluster_time: dropped_session.cluster_time,
            server_session: dropped_session.server_session,
            client: dropped_session.client,
            is_implicit: dropped_session.is_implicit,
            options: dropped_session.options,
            transaction: dropped_session.transaction,
            snapshot_time: dropped_session.snapshot_time,
            operation_time: dropped_session.operation_time,
            timeout_context: None,
            #[cfg(test)]
            convenient_transaction_timeout: None,
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            // Dropped outside of an async context; the server session is lost but the server
            // will reap it after the logical session timeout.
            Err(_) => return,
        };
        if self.transaction.state == TransactionState::InProgress {
            let dropped_session = DroppedClientSession {
                cluster_time: self.cluster_time.clone(),
                server_session: self.server_session.clone(),
                client: self.client.clone(),
                is_implicit: self.is_implicit,
                options: self.options.clone(),
                transaction: self.transaction.take(),
                snapshot_time: self.snapshot_time,
                operation_time: self.operation_time,
            };
            handle.spawn(async move {
                let mut session: ClientSession = dropped_session.into();
                let _result = session.abort_transaction().await;
            });
        } else {
            let client = self.client.clone();
            let server_session = self.server_session.clone();
            handle.spawn(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    id: Document,

    /// The last time an operation was executed with this session.
    last_use: std::time::Instant,

    /// Whether a network error was encountered while using this session.
    dirty: bool,

    /// A monotonically increasing transaction number for this session.
    txn_number: u64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1 minute).
    /// Sessions without a logical session timeout (load-balanced mode) never expire.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}
