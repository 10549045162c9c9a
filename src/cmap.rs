//! Narrow abstractions over the connection layer: driver-side commands, raw command responses,
//! and the handshake-derived description of the server behind a connection. Wire-level encoding
//! and connection pooling live outside this crate.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::{
    bson::{self, Bson, Document, Timestamp},
    client::session::ClusterTime,
    concern::ReadConcernInternal,
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
    sdam::ServerType,
};

/// `Command` is a driver-side abstraction of a server command containing all the information
/// necessary to serialize it to a wire message.
#[derive(Clone, Debug)]
pub struct Command {
    /// The name of the command.
    pub name: String,

    /// The database the command targets.
    pub target_db: String,

    /// The command body.
    pub body: Document,
}

impl Command {
    /// Constructs a new command.
    pub fn new(name: impl Into<String>, target_db: impl Into<String>, body: Document) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    pub(crate) fn set_session_id(&mut self, lsid: &Document) {
        self.body.insert("lsid", lsid.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // this should never fail.
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: u64) {
        self.body.insert("txnNumber", txn_number as i64);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: &ReadConcernInternal) -> Result<()> {
        let doc = bson::to_bson(read_concern)?;
        if let Bson::Document(doc) = doc {
            if !doc.is_empty() {
                self.body.insert("readConcern", doc);
            }
        }
        Ok(())
    }

    pub(crate) fn set_max_time_ms(&mut self, max_time: Duration) {
        self.body.insert("maxTimeMS", max_time.as_millis() as i64);
    }

    pub(crate) fn set_recovery_token(&mut self, token: &Document) {
        self.body.insert("recoveryToken", token.clone());
    }
}

/// A response to a command, decoded to the document level. Decoding beyond that is delegated to
/// each operation's response handling.
#[derive(Clone, Debug)]
pub struct CommandResponse {
    source: ServerAddress,
    raw_response: Document,
    cluster_time: Option<ClusterTime>,
}

impl CommandResponse {
    /// Initializes a response from the raw response document.
    pub fn new(source: ServerAddress, raw_response: Document) -> Self {
        let cluster_time = raw_response
            .get("$clusterTime")
            .and_then(|subdoc| bson::from_bson(subdoc.clone()).ok());
        Self {
            source,
            raw_response,
            cluster_time,
        }
    }

    /// Whether this response indicates success (i.e. "ok: 1").
    pub fn is_success(&self) -> bool {
        match self.raw_response.get("ok") {
            Some(b) => get_int(b) == Some(1),
            None => false,
        }
    }

    /// Converts a failed response into the corresponding command error, preserving any error
    /// labels the server attached.
    pub(crate) fn command_error(&self) -> Error {
        let labels = self
            .raw_response
            .get_array("errorLabels")
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|label| label.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
            .ok();
        match bson::from_bson::<CommandError>(Bson::Document(self.raw_response.clone())) {
            Ok(command_error) => Error::new(ErrorKind::Command(command_error), labels),
            Err(_) => Error::new(
                ErrorKind::Internal {
                    message: "invalid server response to command".to_string(),
                },
                labels,
            ),
        }
    }

    /// Deserializes the body of the response.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_bson(Bson::Document(self.raw_response.clone())).map_err(|e| {
            ErrorKind::Internal {
                message: format!("failed to deserialize server response: {}", e),
            }
            .into()
        })
    }

    /// The raw response document.
    pub fn raw(&self) -> &Document {
        &self.raw_response
    }

    /// The cluster time from the response, if any.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The `operationTime` reported by the server, if any.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.raw_response
            .get("operationTime")
            .and_then(Bson::as_timestamp)
    }

    /// The snapshot timestamp reported by the server, if any. Depending on the command it may be
    /// at the top level or nested under `cursor`.
    pub fn at_cluster_time(&self) -> Option<Timestamp> {
        if let Some(ts) = self
            .raw_response
            .get("atClusterTime")
            .and_then(Bson::as_timestamp)
        {
            return Some(ts);
        }
        self.raw_response
            .get_document("cursor")
            .ok()
            .and_then(|cursor| cursor.get("atClusterTime"))
            .and_then(Bson::as_timestamp)
    }

    /// The sharded transaction recovery token, if any.
    pub fn recovery_token(&self) -> Option<Document> {
        self.raw_response.get_document("recoveryToken").ok().cloned()
    }

    /// The address of the server that sent this response.
    pub fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}

/// The description of the server behind a connection, as determined from the connection
/// handshake.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct StreamDescription {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub max_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without executing an operation
    /// before the server kills them.
    pub logical_session_timeout: Option<Duration>,
}

impl StreamDescription {
    /// Whether this server supports sessions.
    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Whether this server supports retryable writes.
    pub fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.supports_sessions()
            && self.max_wire_version.map_or(false, |version| version >= 6)
    }

    /// Gets a description of a server that can be used for testing.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            server_address: Default::default(),
            initial_server_type: ServerType::RsPrimary,
            max_wire_version: Some(13),
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}
