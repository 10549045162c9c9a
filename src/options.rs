//! Contains the options structs consumed by the execution core.

use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    error::{Error, Result},
    selection_criteria::SelectionCriteria,
};

/// An address of a server in the deployment.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl ServerAddress {
    /// Creates a TCP address from the given host and port.
    pub fn tcp(host: impl Into<String>, port: impl Into<Option<u16>>) -> Self {
        Self::Tcp {
            host: host.into(),
            port: port.into(),
        }
    }

    /// The host of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The amount of time the client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The amount of time a thread should block while waiting to check out a connection before
    /// returning an error. This has no effect when a client-wide `timeout` is configured, as the
    /// checkout then shares the server selection budget.
    pub wait_queue_timeout: Option<Duration>,

    /// The amount of time the client should wait on a single network operation before timing
    /// out. This has no effect when a client-wide `timeout` is configured.
    pub socket_timeout: Option<Duration>,

    /// The overall time limit (`timeoutMS`) shared by every phase of one logical operation:
    /// server selection, connection checkout, and command execution. A zero duration disables
    /// the limit.
    pub timeout: Option<Duration>,

    /// The default read concern for operations performed on the client.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations performed on the client.
    pub write_concern: Option<WriteConcern>,

    /// The default selection criteria for operations performed on the client.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// Contains the options that can be used to create a new
/// [`ClientSession`](crate::ClientSession).
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    ///
    /// If these options are not specified, they will be inherited from the client.
    pub default_transaction_options: Option<TransactionOptions>,

    /// If true, all operations performed in the context of this session will be [causally
    /// consistent](https://www.mongodb.com/docs/manual/core/causal-consistency-read-write-concerns/).
    ///
    /// Defaults to true if [`snapshot`](SessionOptions::snapshot) is unspecified.
    pub causal_consistency: Option<bool>,

    /// If true, all read operations performed using this client session will share the same
    /// snapshot. Defaults to false.
    pub snapshot: Option<bool>,
}

impl SessionOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if let (Some(causal_consistency), Some(snapshot)) = (self.causal_consistency, self.snapshot)
        {
            if causal_consistency && snapshot {
                return Err(Error::invalid_argument(
                    "snapshot reads do not support causal consistency",
                ));
            }
        }
        Ok(())
    }
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction.
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria to use for all read operations in a transaction.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum amount of time to allow a single commitTransaction to run.
    #[serde(
        serialize_with = "crate::serde_util::serialize_duration_option_as_int_millis",
        deserialize_with = "crate::serde_util::deserialize_duration_option_from_u64_millis",
        rename = "maxCommitTimeMS",
        default
    )]
    pub max_commit_time: Option<Duration>,
}
