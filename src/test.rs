//! Shared test doubles: a single-server topology whose responses are scripted per test and whose
//! received commands are recorded for assertion.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    bson::{doc, Document},
    cmap::{Command, CommandResponse, StreamDescription},
    error::{Error, ErrorKind, Result},
    operation::{OperationCategory, OperationWithDefaults, Retryability},
    options::{ClientOptions, ServerAddress},
    retry_budget::RetryBudget,
    sdam::{SelectionContext, Server, ServerType, Topology, TransactionSupportStatus},
    selection_criteria::SelectionCriteria,
    BoxFuture,
    Client,
};

/// A server that pops one scripted response per command. When the script runs out it answers
/// `{ok: 1}`.
#[derive(Debug)]
pub(crate) struct MockServer {
    pub(crate) address: ServerAddress,
    pub(crate) server_type: ServerType,
    pub(crate) max_wire_version: i32,
    pub(crate) logical_session_timeout: Option<Duration>,
    pub(crate) responses: Mutex<VecDeque<Result<Document>>>,
    pub(crate) received: Mutex<Vec<Command>>,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self {
            address: ServerAddress::default(),
            server_type: ServerType::RsPrimary,
            max_wire_version: 13,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            responses: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn respond_with(&self, response: Result<Document>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn received(&self) -> Vec<Command> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn received_named(&self, name: &str) -> Vec<Command> {
        self.received()
            .into_iter()
            .filter(|command| command.name == name)
            .collect()
    }
}

impl Server for MockServer {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    fn description(&self) -> StreamDescription {
        StreamDescription {
            server_address: self.address.clone(),
            initial_server_type: self.server_type,
            max_wire_version: Some(self.max_wire_version),
            logical_session_timeout: self.logical_session_timeout,
        }
    }

    fn run_command<'a>(&'a self, command: Command) -> BoxFuture<'a, Result<CommandResponse>> {
        Box::pin(async move {
            self.received.lock().unwrap().push(command);
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(doc! { "ok": 1 }));
            next.map(|doc| CommandResponse::new(self.address.clone(), doc))
        })
    }
}

/// A topology with a single mock server.
#[derive(Debug)]
pub(crate) struct MockTopology {
    pub(crate) server: Arc<MockServer>,
    pub(crate) load_balanced: bool,
    pub(crate) transaction_support: TransactionSupportStatus,
    pub(crate) budget: RetryBudget,
    /// The deprioritized list passed to each selection call.
    pub(crate) selections: Mutex<Vec<Vec<ServerAddress>>>,
}

impl MockTopology {
    pub(crate) fn bare() -> Self {
        Self {
            server: Arc::new(MockServer::new()),
            load_balanced: false,
            transaction_support: TransactionSupportStatus::Supported,
            budget: RetryBudget::default(),
            selections: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::bare())
    }
}

impl Topology for MockTopology {
    fn select_server<'a>(
        &'a self,
        _criteria: &'a SelectionCriteria,
        context: SelectionContext<'a>,
    ) -> BoxFuture<'a, Result<Arc<dyn Server>>> {
        Box::pin(async move {
            self.selections
                .lock()
                .unwrap()
                .push(context.deprioritized.to_vec());
            if let Some(timeout) = context.timeout {
                if timeout.is_expired() {
                    return Err(ErrorKind::ServerSelection {
                        message: "server selection timed out".to_string(),
                    }
                    .into());
                }
            }
            Ok(self.server.clone() as Arc<dyn Server>)
        })
    }

    fn load_balanced(&self) -> bool {
        self.load_balanced
    }

    fn logical_session_timeout(&self) -> Option<Duration> {
        self.server.logical_session_timeout
    }

    fn common_wire_version(&self) -> Option<i32> {
        Some(self.server.max_wire_version)
    }

    fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.transaction_support
    }

    fn retry_budget(&self) -> &RetryBudget {
        &self.budget
    }
}

pub(crate) fn client_for(topology: Arc<MockTopology>) -> Client {
    Client::new(topology, ClientOptions::default())
}

pub(crate) fn client_with_options(topology: Arc<MockTopology>, options: ClientOptions) -> Client {
    Client::new(topology, options)
}

/// A minimal retryable write used to drive the executor in tests.
pub(crate) struct TestWrite {
    pub(crate) max_attempts: Option<u32>,
}

impl TestWrite {
    pub(crate) fn new() -> Self {
        Self { max_attempts: None }
    }
}

impl OperationWithDefaults for TestWrite {
    type O = Document;

    const NAME: &'static str = "insert";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            Self::NAME,
            "test",
            doc! { Self::NAME: "coll", "documents": [{ "x": 1 }] },
        ))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: crate::operation::WriteConcernOnlyBody = response.body()?;
        body.validate()?;
        Ok(response.raw().clone())
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// A minimal read used where a cursor-creating operation is needed.
pub(crate) struct TestFind;

impl OperationWithDefaults for TestFind {
    type O = Document;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(Self::NAME, "test", doc! { Self::NAME: "coll" }))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(response.raw().clone())
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Read { write_stage: false }
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

pub(crate) fn ok_response() -> Result<Document> {
    Ok(doc! { "ok": 1 })
}

pub(crate) fn command_error_response(code: i32, labels: &[&str]) -> Result<Document> {
    Ok(doc! {
        "ok": 0,
        "code": code,
        "codeName": "TestError",
        "errmsg": "scripted failure",
        "errorLabels": labels.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
    })
}

pub(crate) fn write_concern_error_response() -> Result<Document> {
    Ok(doc! {
        "ok": 1,
        "writeConcernError": {
            "code": 64,
            "codeName": "WriteConcernTimeout",
            "errmsg": "waiting for replication timed out",
        },
    })
}

pub(crate) fn network_error() -> Result<Document> {
    Err(Error::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    )))
}
