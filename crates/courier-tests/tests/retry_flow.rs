use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier::HandlerOutcome;
use courier_tests::harness::{TestEnv, unwrap_success};
use serde_json::json;

#[tokio::test]
async fn lost_commands_are_retransmitted_until_delivered() {
    let env = TestEnv::start().await.unwrap();
    env.server
        .register_handler("cmd1", None, |_msg, _inter| async move {
            HandlerOutcome::Success(json!({ "ok": true }))
        })
        .await;
    let sender = env.client.create_sender(json!({})).await.unwrap();

    // lose the first two copies of the command
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dropped);
    env.client_conn.set_drop_filter(move |msg| {
        msg.contains("\"command\":\"cmd1\"") && counter.fetch_add(1, Ordering::SeqCst) < 2
    });

    let status = sender.command("cmd1", json!({})).await.unwrap();
    unwrap_success(status);

    let attempts = env
        .client_conn
        .sent_messages()
        .iter()
        .filter(|m| m.contains("\"command\":\"cmd1\""))
        .count();
    assert!(attempts >= 3, "expected at least 3 attempts, got {attempts}");
}

#[tokio::test]
async fn exhausted_retry_budget_rejects_with_timeout() {
    let env = TestEnv::start().await.unwrap();
    env.server
        .register_handler("cmd1", None, |_msg, _inter| async move {
            HandlerOutcome::Success(json!({}))
        })
        .await;
    let sender = env.client.create_sender(json!({})).await.unwrap();

    // lose every copy
    env.client_conn
        .set_drop_filter(|msg| msg.contains("\"command\":\"cmd1\""));

    let err = sender.command("cmd1", json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "Failed to secure response in time for cmd1");

    // initial send plus max_ack_retries resends
    let attempts = env
        .client_conn
        .sent_messages()
        .iter()
        .filter(|m| m.contains("\"command\":\"cmd1\""))
        .count();
    assert_eq!(attempts, 5);
}

#[tokio::test]
async fn duplicate_commands_run_the_handler_once() {
    let env = TestEnv::start().await.unwrap();
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = Arc::clone(&handled);
    env.server
        .register_handler("cmd1", None, move |_msg, _inter| {
            let handled = Arc::clone(&handled_clone);
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                // stay busy past the client's retransmission interval
                tokio::time::sleep(Duration::from_millis(120)).await;
                HandlerOutcome::Success(json!({}))
            }
        })
        .await;
    let sender = env.client.create_sender(json!({})).await.unwrap();

    // lose the server's command ACK once so the client retransmits
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dropped);
    env.server_conn.set_drop_filter(move |msg| {
        msg.contains("\"ack\":\"cmd1\"") && counter.fetch_add(1, Ordering::SeqCst) < 1
    });

    let status = sender.command("cmd1", json!({})).await.unwrap();
    unwrap_success(status);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lost_status_ack_resolves_the_call_anyway() {
    let env = TestEnv::start().await.unwrap();
    env.server
        .register_handler("cmd1", None, |_msg, _inter| async move {
            HandlerOutcome::Success(json!({ "ok": true }))
        })
        .await;
    let sender = env.client.create_sender(json!({})).await.unwrap();

    // the client's first status ACK for the command never arrives; the
    // server keeps retrying the status, which the client already
    // resolved and will not resolve twice
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dropped);
    env.client_conn.set_drop_filter(move |msg| {
        msg.contains("\"ack\":\"status\"")
            && msg.contains("\"txn\":\"2\"")
            && counter.fetch_add(1, Ordering::SeqCst) < 1
    });

    let status = sender.command("cmd1", json!({})).await.unwrap();
    assert_eq!(unwrap_success(status)["ok"], json!(true));
}
