use std::time::Duration;

use courier::HandlerOutcome;
use courier_tests::harness::{TestEnv, fast_client_config, fast_server_config, unwrap_success};
use serde_json::json;

#[tokio::test]
async fn session_ids_allocate_sequentially() {
    let env = TestEnv::start().await.unwrap();

    let first = env.client.create_sender(json!({})).await.unwrap();
    let second = env.client.create_sender(json!({})).await.unwrap();
    assert_eq!(first.id(), "1");
    assert_eq!(second.id(), "2");
    assert_eq!(env.server.number_of_senders().await, 2);
}

#[tokio::test]
async fn idle_sessions_are_evicted() {
    let env = TestEnv::start_with(
        fast_client_config(),
        fast_server_config(Duration::from_millis(150)),
    )
    .await
    .unwrap();

    let sender = env.client.create_sender(json!({})).await.unwrap();
    assert_eq!(sender.inactivity_ms(), 150);
    assert_eq!(env.server.number_of_senders().await, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(env.server.number_of_senders().await, 0);

    // the local deadline trips before anything reaches the wire
    let err = sender.command("cmd1", json!({})).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Sender did not make a call within 150ms. Cannot send again"
    );
}

#[tokio::test]
async fn activity_keeps_the_session_alive() {
    let env = TestEnv::start_with(
        fast_client_config(),
        fast_server_config(Duration::from_millis(250)),
    )
    .await
    .unwrap();
    env.server
        .register_handler("ping", None, |_msg, _inter| async move {
            HandlerOutcome::Success(json!({}))
        })
        .await;

    let sender = env.client.create_sender(json!({})).await.unwrap();
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = sender.command("ping", json!({})).await.unwrap();
        unwrap_success(status);
    }
    assert_eq!(env.server.number_of_senders().await, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(env.server.number_of_senders().await, 0);
}

#[tokio::test]
async fn unacknowledged_creation_drops_the_session() {
    let env = TestEnv::start().await.unwrap();

    // the client never manages to ACK the creation status; it still
    // resolves locally, but the server gives up on the session
    env.client_conn
        .set_drop_filter(|msg| msg.contains("\"ack\":\"status\""));

    let sender = env.client.create_sender(json!({})).await.unwrap();
    assert_eq!(sender.id(), "1");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(env.server.number_of_senders().await, 0);
}

#[tokio::test]
async fn nacked_creation_drops_the_session_immediately() {
    let env = TestEnv::start().await.unwrap();

    // suppress the client's status ACK so the session stays unresolved,
    // then refuse the creation status outright
    env.client_conn
        .set_drop_filter(|msg| msg.contains("\"ack\":\"status\""));

    let sender = env.client.create_sender(json!({})).await.unwrap();
    assert_eq!(sender.id(), "1");
    assert_eq!(env.server.number_of_senders().await, 1);

    env.server_conn
        .inject_incoming(r#"{"nack":"status","for":"1","txn":"1","reason":"badMessage"}"#);

    // well inside the retry budget
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.server.number_of_senders().await, 0);
}

#[tokio::test]
async fn server_close_evicts_all_sessions() {
    let env = TestEnv::start().await.unwrap();
    env.client.create_sender(json!({})).await.unwrap();
    env.client.create_sender(json!({})).await.unwrap();
    assert_eq!(env.server.number_of_senders().await, 2);

    env.server.close().await.unwrap();
    assert_eq!(env.server.number_of_senders().await, 0);
}

#[tokio::test]
async fn commands_without_a_session_id_are_rejected() {
    let env = TestEnv::start().await.unwrap();
    env.server
        .register_handler("cmd1", None, |_msg, _inter| async move {
            HandlerOutcome::Success(json!({}))
        })
        .await;

    // hand-build a command missing its `for` field
    env.server_conn
        .inject_incoming(r#"{"txn":"9","command":"cmd1","data":{}}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let nack = env
        .server_conn
        .sent_messages()
        .into_iter()
        .find(|m| m.contains("\"nack\":\"cmd1\""))
        .expect("badMessage NACK");
    assert!(nack.contains("\"reason\":\"badMessage\""));
}
