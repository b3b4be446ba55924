mod common;

use std::sync::Arc;
use std::time::Duration;

use clash_dash::error::StreamError;
use clash_dash::logs::{
    LogLevel, LogReconnect, LogStreamClient, LogStreamEvent, LogStreamStatus,
};
use common::{direct_endpoint, FakeTransport};
use tokio::sync::mpsc;

async fn next_event(rx: &mut mpsc::UnboundedReceiver<LogStreamEvent>) -> LogStreamEvent {
    tokio::time::timeout(Duration::from_secs(300), rx.recv())
        .await
        .expect("timed out waiting for a log event")
        .expect("event channel closed")
}

fn log_line(level: &str, payload: &str) -> String {
    serde_json::json!({ "type": level, "payload": payload }).to_string()
}

#[tokio::test(start_paused = true)]
async fn test_entries_are_buffered_and_pings_skipped() {
    let fake = Arc::new(FakeTransport::new());
    let stream = fake.push_stream();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut client = LogStreamClient::new(fake.clone(), 2, events_tx);
    client.connect(direct_endpoint(), LogLevel::Info).await;

    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Connected)
    );
    assert!(client.is_connected());

    stream.send(Ok("ping".to_string())).unwrap();
    for payload in ["one", "two", "three"] {
        stream.send(Ok(log_line("info", payload))).unwrap();
    }
    for expected in ["one", "two", "three"] {
        match next_event(&mut events).await {
            LogStreamEvent::Entry(entry) => {
                assert_eq!(entry.message, expected);
                assert_eq!(entry.level, "INFO");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    let buffered: Vec<String> = client.entries().into_iter().map(|e| e.message).collect();
    assert_eq!(buffered, vec!["two", "three"]);

    client.clear();
    assert!(client.entries().is_empty());
    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_set_level_reconnects_with_new_filter() {
    let fake = Arc::new(FakeTransport::new());
    let _first = fake.push_stream();
    let _second = fake.push_stream();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut client = LogStreamClient::new(fake.clone(), 100, events_tx);

    client.connect(direct_endpoint(), LogLevel::Info).await;
    next_event(&mut events).await;
    client.set_level(LogLevel::Debug).await;
    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Connected)
    );

    let opens = fake.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0].path, "/logs");
    assert_eq!(opens[0].query, vec![("level".to_string(), "info".to_string())]);
    assert_eq!(opens[1].query, vec![("level".to_string(), "debug".to_string())]);
    assert_eq!(client.level(), LogLevel::Debug);

    // same level is a no-op
    client.set_level(LogLevel::Debug).await;
    assert_eq!(fake.opens().len(), 2);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let fake = Arc::new(FakeTransport::new());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut client = LogStreamClient::new(fake.clone(), 100, events_tx).with_reconnect(
        LogReconnect {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            max_attempts: 2,
        },
    );
    client.connect(direct_endpoint(), LogLevel::Info).await;

    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(3)
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(6)
        })
    );
    match next_event(&mut events).await {
        LogStreamEvent::Status(LogStreamStatus::Disconnected(reason)) => {
            assert!(reason.contains("no stream scripted"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(fake.opens().len(), 3);
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_entry_resets_reconnect_attempts() {
    let fake = Arc::new(FakeTransport::new());
    let first = fake.push_stream();
    let second = fake.push_stream();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut client = LogStreamClient::new(fake.clone(), 100, events_tx);
    client.connect(direct_endpoint(), LogLevel::Info).await;
    next_event(&mut events).await;

    first.send(Ok(log_line("error", "boom"))).unwrap();
    first
        .send(Err(StreamError::Disconnected("reset".to_string())))
        .unwrap();
    next_event(&mut events).await;
    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(3)
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Connected)
    );

    second.send(Ok(log_line("info", "back"))).unwrap();
    drop(second);
    next_event(&mut events).await;
    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(3)
        })
    );
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_disconnects_and_resume_reconnects() {
    let fake = Arc::new(FakeTransport::new());
    let _first = fake.push_stream();
    let _second = fake.push_stream();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut client = LogStreamClient::new(fake.clone(), 100, events_tx);
    client.connect(direct_endpoint(), LogLevel::Warning).await;
    next_event(&mut events).await;

    assert!(client.toggle_pause().await);
    assert!(!client.is_connected());

    // reconnecting while paused only remembers the target
    client.connect(direct_endpoint(), LogLevel::Error).await;
    assert_eq!(fake.opens().len(), 1);

    assert!(!client.toggle_pause().await);
    assert_eq!(
        next_event(&mut events).await,
        LogStreamEvent::Status(LogStreamStatus::Connected)
    );
    assert_eq!(
        fake.opens()[1].query,
        vec![("level".to_string(), "error".to_string())]
    );
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent_and_silences_events() {
    let fake = Arc::new(FakeTransport::new());
    let stream = fake.push_stream();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut client = LogStreamClient::new(fake.clone(), 100, events_tx);
    client.connect(direct_endpoint(), LogLevel::Info).await;
    next_event(&mut events).await;

    client.disconnect().await;
    client.disconnect().await;
    let _ = stream.send(Ok(log_line("info", "late")));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(events.try_recv().is_err());
    assert!(client.entries().is_empty());
}
