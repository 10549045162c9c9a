use std::{sync::Arc, time::Duration};

use crate::{
    bson::doc,
    error::{
        ErrorKind,
        NO_WRITES_PERFORMED,
        RETRYABLE_ERROR,
        RETRYABLE_WRITE_ERROR,
        SYSTEM_OVERLOADED_ERROR,
    },
    operation::RunCommand,
    options::ClientOptions,
    retry_budget::{RetryBudget, BUDGET_REFRESH, DEFAULT_CAPACITY, RETRY_COST},
    test::{
        client_for,
        client_with_options,
        command_error_response,
        network_error,
        ok_response,
        MockTopology,
        TestFind,
        TestWrite,
    },
};

#[tokio::test]
async fn retryable_write_retries_until_success_and_rewards_budget() {
    let topology = MockTopology::new();
    // Drain the budget so the deposits made by this operation are observable.
    topology.budget.consume(DEFAULT_CAPACITY);
    topology
        .server
        .respond_with(command_error_response(91, &[RETRYABLE_WRITE_ERROR]));
    topology
        .server
        .respond_with(command_error_response(91, &[RETRYABLE_WRITE_ERROR]));
    topology.server.respond_with(ok_response());
    let client = client_for(topology.clone());

    let result = client
        .execute_operation(
            TestWrite {
                max_attempts: Some(3),
            },
            None,
        )
        .await;
    assert!(result.is_ok());
    assert!(client.is_connected());

    let commands = topology.server.received_named("insert");
    assert_eq!(commands.len(), 3);
    for command in &commands {
        assert!(command.body.contains_key("lsid"));
        assert_eq!(command.body.get_i64("txnNumber").unwrap(), 1);
    }
    assert_eq!(topology.budget.available(), BUDGET_REFRESH + RETRY_COST);
}

#[tokio::test]
async fn first_error_retained_when_later_errors_performed_no_writes() {
    let topology = MockTopology::new();
    topology
        .server
        .respond_with(command_error_response(91, &[RETRYABLE_WRITE_ERROR]));
    topology.server.respond_with(command_error_response(
        112,
        &[RETRYABLE_WRITE_ERROR, NO_WRITES_PERFORMED],
    ));
    topology.server.respond_with(command_error_response(
        189,
        &[RETRYABLE_WRITE_ERROR, NO_WRITES_PERFORMED],
    ));
    let client = client_for(topology.clone());

    let error = client
        .execute_operation(
            TestWrite {
                max_attempts: Some(3),
            },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(91));
}

#[tokio::test]
async fn later_error_replaces_first_when_writes_were_performed() {
    let topology = MockTopology::new();
    topology
        .server
        .respond_with(command_error_response(91, &[RETRYABLE_WRITE_ERROR]));
    topology
        .server
        .respond_with(command_error_response(112, &[RETRYABLE_WRITE_ERROR]));
    let client = client_for(topology.clone());

    let error = client
        .execute_operation(
            TestWrite {
                max_attempts: Some(2),
            },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(112));
}

#[tokio::test]
async fn overload_retry_is_abandoned_without_budget() {
    let topology = Arc::new(MockTopology {
        budget: RetryBudget::new(RETRY_COST - 1),
        ..MockTopology::bare()
    });
    topology.server.respond_with(command_error_response(
        462,
        &[SYSTEM_OVERLOADED_ERROR, RETRYABLE_ERROR],
    ));
    let client = client_for(topology.clone());

    let operation = RunCommand::new("admin", doc! { "ping": 1 }, None).unwrap();
    let error = client.execute_operation(operation, None).await.unwrap_err();
    assert!(error.contains_label(SYSTEM_OVERLOADED_ERROR));
    assert_eq!(topology.server.received_named("ping").len(), 1);
}

#[tokio::test]
async fn overload_retry_backs_off_and_succeeds() {
    let topology = MockTopology::new();
    topology.server.respond_with(command_error_response(
        462,
        &[SYSTEM_OVERLOADED_ERROR, RETRYABLE_ERROR],
    ));
    topology.server.respond_with(ok_response());
    let client = client_for(topology.clone());

    let operation = RunCommand::new("admin", doc! { "ping": 1 }, None).unwrap();
    client.execute_operation(operation, None).await.unwrap();
    assert_eq!(topology.server.received_named("ping").len(), 2);
    // The consumed retry cost is repaid with interest on success, clamped at capacity.
    assert_eq!(topology.budget.available(), DEFAULT_CAPACITY);
}

#[tokio::test]
async fn shutdown_client_rejects_operations() {
    let client = client_for(MockTopology::new());
    client.shutdown();
    let error = client
        .execute_operation(TestWrite::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown));
}

#[tokio::test]
async fn session_must_come_from_the_executing_client() {
    let client_a = client_for(MockTopology::new());
    let client_b = client_for(MockTopology::new());
    let mut session = client_a.start_session(None).await.unwrap();
    let error = client_b
        .execute_operation(TestWrite::new(), Some(&mut session))
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[tokio::test]
async fn implicit_session_is_returned_to_the_pool() {
    let topology = MockTopology::new();
    let client = client_for(topology);
    client
        .execute_operation(TestWrite::new(), None)
        .await
        .unwrap();
    // The check-in happens on a spawned task.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.inner.session_pool.len().await, 1);
}

#[tokio::test]
async fn failed_server_is_deprioritized_on_reselection() {
    let topology = MockTopology::new();
    topology.server.respond_with(network_error());
    topology.server.respond_with(ok_response());
    let client = client_for(topology.clone());

    client
        .execute_operation(
            TestWrite {
                max_attempts: Some(2),
            },
            None,
        )
        .await
        .unwrap();

    let selections = topology.selections.lock().unwrap().clone();
    assert_eq!(selections.len(), 2);
    assert!(selections[0].is_empty());
    assert_eq!(selections[1], vec![topology.server.address.clone()]);
}

#[tokio::test]
async fn write_retry_disabled_by_client_options() {
    let topology = MockTopology::new();
    topology.server.respond_with(network_error());
    let client = client_with_options(
        topology.clone(),
        ClientOptions::builder().retry_writes(false).build(),
    );

    let error = client
        .execute_operation(TestWrite::new(), None)
        .await
        .unwrap_err();
    assert!(error.is_network_error());
    assert_eq!(topology.server.received_named("insert").len(), 1);
}

#[tokio::test]
async fn read_retry_disabled_by_client_options() {
    let topology = MockTopology::new();
    topology.server.respond_with(network_error());
    let client = client_with_options(
        topology.clone(),
        ClientOptions::builder().retry_reads(false).build(),
    );

    let error = client.execute_operation(TestFind, None).await.unwrap_err();
    assert!(error.is_network_error());
    assert_eq!(topology.server.received_named("find").len(), 1);
}

#[tokio::test]
async fn legacy_transaction_numbers_error_maps_to_guidance() {
    let topology = MockTopology::new();
    topology.server.respond_with(Ok(doc! {
        "ok": 0,
        "code": 20,
        "errmsg": "Transaction numbers are only allowed on a replica set member or mongos",
    }));
    let client = client_for(topology);

    let error = client
        .execute_operation(TestWrite::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
    assert!(error.to_string().contains("retryWrites=false"));
}

#[tokio::test]
async fn csot_attaches_max_time_ms() {
    let topology = MockTopology::new();
    let client = client_with_options(
        topology.clone(),
        ClientOptions::builder()
            .timeout(Duration::from_secs(10))
            .build(),
    );
    client.execute_operation(TestFind, None).await.unwrap();
    let command = &topology.server.received()[0];
    assert!(command.body.get("maxTimeMS").is_some());
}

#[tokio::test]
async fn legacy_mode_omits_max_time_ms() {
    let topology = MockTopology::new();
    let client = client_for(topology.clone());
    client.execute_operation(TestFind, None).await.unwrap();
    let command = &topology.server.received()[0];
    assert!(command.body.get("maxTimeMS").is_none());
}
