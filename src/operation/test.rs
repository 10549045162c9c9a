use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{AbortTransaction, CommitTransaction, Operation, RunCommand, WriteConcernOnlyBody};
use crate::{
    bson::{doc, Timestamp},
    client::session::TransactionPin,
    cmap::{CommandResponse, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    error::{ErrorKind, WriteFailure},
    options::{ServerAddress, TransactionOptions},
    selection_criteria::SelectionCriteria,
};

#[test]
fn commit_build_is_minimal_without_options() {
    let mut commit = CommitTransaction::new(None, None);
    let command = commit.build(&StreamDescription::new_testing()).unwrap();
    assert_eq!(command.name, "commitTransaction");
    assert_eq!(command.target_db, "admin");
    assert_eq!(command.body, doc! { "commitTransaction": 1 });
}

#[test]
fn commit_build_includes_the_recovery_token() {
    let token = doc! { "shard": "rs0" };
    let mut commit = CommitTransaction::new(None, Some(token.clone()));
    let command = commit.build(&StreamDescription::new_testing()).unwrap();
    assert_eq!(command.body.get_document("recoveryToken").unwrap(), &token);
}

#[test]
fn commit_retry_upgrades_the_write_concern() {
    let mut commit = CommitTransaction::new(None, None);
    assert_eq!(commit.max_attempts(), Some(2));

    commit.update_for_retry();
    let command = commit.build(&StreamDescription::new_testing()).unwrap();
    let write_concern = command.body.get_document("writeConcern").unwrap();
    assert_eq!(write_concern.get_str("w").unwrap(), "majority");
    assert_eq!(write_concern.get_i32("wtimeout").unwrap(), 10_000);
}

#[test]
fn commit_retry_keeps_an_existing_wtimeout() {
    let options = TransactionOptions::builder()
        .write_concern(
            WriteConcern::builder()
                .w(Acknowledgment::Nodes(1))
                .w_timeout(Duration::from_secs(5))
                .build(),
        )
        .build();
    let mut commit = CommitTransaction::new(Some(options), None);
    commit.update_for_retry();
    let command = commit.build(&StreamDescription::new_testing()).unwrap();
    let write_concern = command.body.get_document("writeConcern").unwrap();
    assert_eq!(write_concern.get_str("w").unwrap(), "majority");
    assert_eq!(write_concern.get_i32("wtimeout").unwrap(), 5000);
}

#[test]
fn abort_routes_to_the_pinned_mongos_until_retry() {
    let address = ServerAddress::tcp("mongos.example.com", 27017);
    let pin = TransactionPin::Mongos(SelectionCriteria::from_address(address));
    let token = doc! { "shard": "rs0" };
    let mut abort = AbortTransaction::new(None, Some(pin), Some(token.clone()));
    assert!(abort.selection_criteria().is_some());

    let command = abort.build(&StreamDescription::new_testing()).unwrap();
    assert_eq!(command.name, "abortTransaction");
    assert_eq!(command.body.get_document("recoveryToken").unwrap(), &token);

    abort.update_for_retry();
    assert!(abort.selection_criteria().is_none());
}

#[test]
fn abort_omits_an_empty_write_concern() {
    let mut abort = AbortTransaction::new(Some(WriteConcern::builder().build()), None, None);
    let command = abort.build(&StreamDescription::new_testing()).unwrap();
    assert!(!command.body.contains_key("writeConcern"));

    let mut abort = AbortTransaction::new(Some(WriteConcern::majority()), None, None);
    let command = abort.build(&StreamDescription::new_testing()).unwrap();
    let write_concern = command.body.get_document("writeConcern").unwrap();
    assert_eq!(write_concern.get_str("w").unwrap(), "majority");
}

#[test]
fn run_command_rejects_an_empty_document() {
    let error = RunCommand::new("admin", doc! {}, None).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[test]
fn run_command_is_named_after_its_first_key() {
    let mut op = RunCommand::new("admin", doc! { "ping": 1, "comment": "hi" }, None).unwrap();
    assert_eq!(op.name(), "ping");
    let command = op.build(&StreamDescription::new_testing()).unwrap();
    assert_eq!(command.name, "ping");
    assert_eq!(command.target_db, "admin");
}

#[test]
fn cursor_cleanup_commands_cannot_join_sessions() {
    let op = RunCommand::new("admin", doc! { "killCursors": "coll" }, None).unwrap();
    assert!(!op.supports_sessions());

    let op = RunCommand::new("admin", doc! { "ping": 1 }, None).unwrap();
    assert!(op.supports_sessions());
}

#[test]
fn write_concern_errors_surface_with_their_labels() {
    let response = CommandResponse::new(
        ServerAddress::default(),
        doc! {
            "ok": 1,
            "writeConcernError": {
                "code": 64,
                "codeName": "WriteConcernTimeout",
                "errmsg": "waiting for replication timed out",
            },
            "errorLabels": ["UnknownTransactionCommitResult"],
        },
    );
    assert!(response.is_success());
    let body: WriteConcernOnlyBody = response.body().unwrap();
    let error = body.validate().unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::Write(WriteFailure::WriteConcernError(_))
    ));
    assert!(error.contains_label("UnknownTransactionCommitResult"));

    let clean: WriteConcernOnlyBody = CommandResponse::new(ServerAddress::default(), doc! { "ok": 1 })
        .body()
        .unwrap();
    assert!(clean.validate().is_ok());
}

#[test]
fn command_errors_keep_server_labels() {
    let response = CommandResponse::new(
        ServerAddress::default(),
        doc! {
            "ok": 0,
            "code": 112,
            "codeName": "WriteConflict",
            "errmsg": "write conflict",
            "errorLabels": ["TransientTransactionError"],
        },
    );
    assert!(!response.is_success());
    let error = response.command_error();
    assert_eq!(error.code(), Some(112));
    assert!(error.contains_label("TransientTransactionError"));
}

#[test]
fn response_timestamps_are_extracted() {
    let response = CommandResponse::new(
        ServerAddress::default(),
        doc! {
            "ok": 1.0,
            "operationTime": Timestamp { time: 42, increment: 1 },
            "$clusterTime": {
                "clusterTime": Timestamp { time: 42, increment: 2 },
                "signature": {},
            },
            "cursor": {
                "id": 0_i64,
                "atClusterTime": Timestamp { time: 41, increment: 0 },
            },
        },
    );
    assert!(response.is_success());
    assert_eq!(
        response.operation_time(),
        Some(Timestamp {
            time: 42,
            increment: 1,
        })
    );
    assert_eq!(
        response.cluster_time().unwrap().cluster_time,
        Timestamp {
            time: 42,
            increment: 2,
        }
    );
    assert_eq!(
        response.at_cluster_time(),
        Some(Timestamp {
            time: 41,
            increment: 0,
        })
    );
}
