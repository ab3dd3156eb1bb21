use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier::HandlerOutcome;
use courier_protocol::StatusMessage;
use courier_tests::harness::{TestEnv, fast_client_config, unwrap_success};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn intermediate_statuses_reach_the_caller_in_order() {
    let env = TestEnv::start().await.unwrap();
    env.server
        .register_handler("progress", None, |_msg, inter| async move {
            for step in 1..=3 {
                assert!(inter.send(json!({ "step": step })).await);
            }
            HandlerOutcome::Success(json!({ "done": true }))
        })
        .await;

    let sender = env.client.create_sender(json!({})).await.unwrap();
    let mut seen = Vec::new();
    let status = sender
        .command_with_updates("progress", json!({}), |update| seen.push(update))
        .await
        .unwrap();

    // each update arrives as the full status, modifier and payload intact
    assert_eq!(seen.len(), 3);
    for (idx, update) in seen.iter().enumerate() {
        match update {
            StatusMessage::Intermediate {
                sender_id,
                inter_modifier,
                data,
                ..
            } => {
                assert_eq!(sender_id, sender.id());
                assert_eq!(inter_modifier, &(idx + 1).to_string());
                assert_eq!(data, &json!({ "step": idx + 1 }));
            }
            other => panic!("expected an intermediate status, got {other:?}"),
        }
    }
    assert_eq!(unwrap_success(status)["done"], json!(true));

    // each intermediate was ACK'd under its own modifier
    let acks: Vec<String> = env
        .client_conn
        .sent_messages()
        .into_iter()
        .filter(|m| m.contains("\"ack\":\"status\"") && m.contains("interModifier"))
        .collect();
    assert_eq!(acks.len(), 3);
    assert!(acks[0].contains("\"interModifier\":\"1\""));
    assert!(acks[2].contains("\"interModifier\":\"3\""));
}

#[tokio::test]
async fn retransmitted_intermediates_are_surfaced_once() {
    let env = TestEnv::start_with(
        fast_client_config(),
        // small budget so the unacknowledged intermediate gives up fast
        courier::ServerConfig {
            ack_retry_delay: Duration::from_millis(40),
            max_ack_retries: 2,
            max_sender_inactivity: Duration::from_secs(30),
            id_generator: None,
        },
    )
    .await
    .unwrap();

    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    env.server
        .register_handler("progress", None, move |_msg, inter| {
            let result_tx = result_tx.clone();
            async move {
                let delivered = inter.send(json!({ "step": 1 })).await;
                let _ = result_tx.send(delivered);
                HandlerOutcome::Success(json!({}))
            }
        })
        .await;

    let sender = env.client.create_sender(json!({})).await.unwrap();

    // the client's intermediate ACK never arrives, so the server
    // retransmits the intermediate; the client surfaces it once
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dropped);
    env.client_conn.set_drop_filter(move |msg| {
        msg.contains("\"ack\":\"status\"")
            && msg.contains("interModifier")
            && counter.fetch_add(1, Ordering::SeqCst) < 1
    });

    let updates = Arc::new(AtomicUsize::new(0));
    let updates_clone = Arc::clone(&updates);
    let status = sender
        .command_with_updates("progress", json!({}), move |_update| {
            updates_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    unwrap_success(status);

    assert_eq!(updates.load(Ordering::SeqCst), 1);
    // without its ACK the sub-transaction exhausts its budget
    assert_eq!(result_rx.recv().await, Some(false));
}

#[tokio::test]
async fn intermediates_after_completion_are_refused() {
    let env = TestEnv::start().await.unwrap();
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    env.server
        .register_handler("fireforget", None, move |_msg, inter| {
            let result_tx = result_tx.clone();
            async move {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let _ = result_tx.send(inter.send(json!({ "late": true })).await);
                });
                HandlerOutcome::Success(json!({}))
            }
        })
        .await;

    let sender = env.client.create_sender(json!({})).await.unwrap();
    let status = sender.command("fireforget", json!({})).await.unwrap();
    unwrap_success(status);

    assert_eq!(result_rx.recv().await, Some(false));
}
