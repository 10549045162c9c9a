//! The narrow interfaces through which the execution core consumes server discovery and
//! monitoring. Topology maintenance itself lives outside this crate; the traits here expose only
//! what operation execution needs: server selection, read-only deployment configuration, and the
//! shared retry budget.

use std::{fmt::Debug, sync::Arc, time::Duration};

use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    options::ServerAddress,
    retry_budget::RetryBudget,
    selection_criteria::SelectionCriteria,
    timeout::Timeout,
    BoxFuture,
};

/// The type of a server in the deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ServerType {
    Standalone,
    Mongos,
    RsPrimary,
    RsSecondary,
    LoadBalancer,
    Unknown,
}

impl ServerType {
    /// Whether this server can serve data-bearing operations.
    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::Mongos
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::LoadBalancer
        )
    }
}

/// A view of a server used by selection predicates.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerInfo {
    /// The address of the server.
    pub address: ServerAddress,

    /// The type of the server.
    pub server_type: ServerType,

    /// The maximum wire version the server understands.
    pub max_wire_version: Option<i32>,
}

/// Whether a topology supports transactions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionSupportStatus {
    /// It is not known yet whether the topology supports transactions. This is possible if no
    /// data-bearing servers have been discovered yet.
    Undetermined,

    /// Transactions are not supported by this topology.
    Unsupported,

    /// Transactions are supported by this topology.
    Supported,
}

/// Parameters for a single server selection call.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct SelectionContext<'a> {
    /// The name of the command being executed, for diagnostics.
    pub operation_name: &'a str,

    /// Servers a previous attempt failed against; a healthy alternative is preferred when one
    /// exists.
    pub deprioritized: &'a [ServerAddress],

    /// The timer bounding this selection call.
    pub timeout: Option<Timeout>,
}

/// The deployment topology as consumed by operation execution.
pub trait Topology: Send + Sync + Debug {
    /// Selects a server suitable for `criteria`, waiting for topology changes until the
    /// context's timer expires.
    fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
        context: SelectionContext<'a>,
    ) -> BoxFuture<'a, Result<Arc<dyn Server>>>;

    /// Whether the deployment is behind a load balancer.
    fn load_balanced(&self) -> bool;

    /// The logical session timeout advertised by the deployment, if known.
    fn logical_session_timeout(&self) -> Option<Duration>;

    /// The highest wire version common to all known servers, if known.
    fn common_wire_version(&self) -> Option<i32>;

    /// Whether the deployment supports transactions.
    fn transaction_support_status(&self) -> TransactionSupportStatus;

    /// The shared backpressure budget throttling overload retries.
    fn retry_budget(&self) -> &RetryBudget;
}

/// A single selected server, able to execute commands.
pub trait Server: Send + Sync + Debug {
    /// The address of this server.
    fn address(&self) -> &ServerAddress;

    /// The handshake-derived description of this server.
    fn description(&self) -> StreamDescription;

    /// Executes a command against this server and returns the raw response. Decoding and error
    /// mapping are delegated back to the operation.
    fn run_command<'a>(&'a self, command: Command) -> BoxFuture<'a, Result<CommandResponse>>;
}
