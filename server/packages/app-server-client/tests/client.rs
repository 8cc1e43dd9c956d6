mod common;

use std::time::Duration;

use codex_bridge_app_server_client::{
    ClientError, ClientOptions, RawEvent, CLOSED_MESSAGE, STALLED_MESSAGE,
};
use common::FakeAppServer;
use futures::StreamExt;
use serde_json::json;

#[tokio::test]
async fn handshake_then_requests() {
    let fake = FakeAppServer::new();
    let client = fake.client();

    client.ensure_started().await.expect("start");
    assert!(client.is_alive());
    assert!(client.pid().is_some());

    // A second call reuses the running process.
    client.ensure_started().await.expect("start again");
    assert_eq!(fake.spawn_count(), 1);

    // `thread/started` arrives before the response and is discarded.
    let started = client.thread_start(None).await.expect("thread/start");
    assert_eq!(started["thread"]["id"], "thr_new");

    let listed = client.thread_list(20, None).await.expect("thread/list");
    assert_eq!(listed["data"][0]["id"], "thr_1");
    assert_eq!(listed["nextCursor"], "cur_2");

    let read = client.thread_read("thr_1").await.expect("thread/read");
    assert_eq!(read["thread"]["turns"][0]["items"].as_array().map(Vec::len), Some(3));

    client.close().await;
    assert!(!client.is_alive());
}

#[tokio::test]
async fn rpc_errors_leave_the_client_usable() {
    let fake = FakeAppServer::new();
    let client = fake.client();
    client.ensure_started().await.expect("start");

    match client.thread_read("missing").await {
        Err(ClientError::Rpc { method, error }) => {
            assert_eq!(method, "thread/read");
            assert_eq!(error.code, Some(-32600));
            assert!(error.message.contains("not found"));
        }
        other => panic!("expected rpc error, got {other:?}"),
    }

    assert!(client.is_alive());
    let resumed = client.thread_resume("thr_1").await.expect("thread/resume");
    assert_eq!(resumed["thread"]["id"], "thr_1");

    match client.request("thread/archive", None).await {
        Err(ClientError::Rpc { error, .. }) => assert_eq!(error.code, Some(-32601)),
        other => panic!("expected method-not-found, got {other:?}"),
    }
    client.close().await;
}

#[tokio::test]
async fn failed_login_aborts_startup() {
    let fake = FakeAppServer::new().with_env("FAKE_LOGIN", "reject");
    let client = fake.client_with(ClientOptions {
        api_key: Some("sk-test".to_string()),
        request_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(500),
        turn_idle_timeout: None,
    });

    match client.ensure_started().await {
        Err(ClientError::Authentication { error }) => {
            assert_eq!(error.message, "invalid api key");
        }
        other => panic!("expected authentication failure, got {other:?}"),
    }
    assert!(!client.is_alive());
}

#[tokio::test]
async fn spawn_failure_is_reported() {
    let client = codex_bridge_app_server_client::AppServerClient::new(
        codex_bridge_app_server_client::LaunchSpec::app_server("/nonexistent/codex"),
        ClientOptions::default(),
    );
    match client.ensure_started().await {
        Err(err @ ClientError::Spawn { .. }) => assert!(err.is_fatal()),
        other => panic!("expected spawn failure, got {other:?}"),
    }
}

#[tokio::test]
async fn turn_stream_yields_events_in_order() {
    let fake = FakeAppServer::new();
    let client = fake.client();
    client.ensure_started().await.expect("start");

    let events: Vec<RawEvent> = client
        .stream_turn("thr_new", "list files", None)
        .await
        .expect("turn/start")
        .collect()
        .await;

    match &events[0] {
        RawEvent::TurnStarted { turn } => assert_eq!(turn["id"], "turn_1"),
        other => panic!("expected turn start first, got {other:?}"),
    }
    let methods: Vec<&str> = events.iter().filter_map(RawEvent::method).collect();
    assert_eq!(
        methods,
        vec![
            "turn/started",
            "item/started",
            "item/reasoning/summaryTextDelta",
            "item/completed",
            "item/started",
            "item/commandExecution/outputDelta",
            "item/completed",
            "item/agentMessage/delta",
            "item/agentMessage/delta",
            "item/completed",
            "thread/tokenUsage/updated",
            "turn/completed",
        ]
    );

    // The stream released the client; plain requests work again.
    let listed = client.thread_list(5, Some("cur_2")).await.expect("thread/list");
    assert_eq!(listed["data"][0]["id"], "thr_1");
    client.close().await;
}

#[tokio::test]
async fn rejected_turn_start_becomes_a_synthetic_error() {
    let fake = FakeAppServer::new().with_env("FAKE_TURN", "reject");
    let client = fake.client();
    client.ensure_started().await.expect("start");

    let events: Vec<RawEvent> = client
        .stream_turn("thr_new", "hi", Some("gpt-5"))
        .await
        .expect("turn/start written")
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        RawEvent::Error { message, error } => {
            assert_eq!(message, "turn already running");
            assert_eq!(error.as_ref().map(|e| e["code"].clone()), Some(json!(-32602)));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(client.is_alive());
    client.close().await;
}

#[tokio::test]
async fn pipe_closed_mid_turn_ends_with_synthetic_error() {
    let fake = FakeAppServer::new().with_env("FAKE_TURN", "crash");
    let client = fake.client();
    client.ensure_started().await.expect("start");

    let stream = client
        .stream_turn("thr_new", "hi", None)
        .await
        .expect("turn/start");
    let events: Vec<RawEvent> = tokio::time::timeout(Duration::from_secs(10), stream.collect())
        .await
        .expect("stream must end");

    assert_eq!(events.len(), 3, "events: {events:?}");
    assert!(matches!(events[0], RawEvent::TurnStarted { .. }));
    assert_eq!(events[1].method(), Some("item/agentMessage/delta"));
    assert_eq!(events[2], RawEvent::closed());
    assert!(matches!(&events[2], RawEvent::Error { message, .. } if message == CLOSED_MESSAGE));

    assert!(!client.is_alive());
    let tail = client.drain_diagnostics(Duration::from_secs(1)).await;
    assert!(tail.iter().any(|line| line == "fake app-server crashing"), "tail: {tail:?}");

    match client.thread_list(5, None).await {
        Err(err @ ClientError::Closed { .. }) => assert!(err.is_fatal()),
        other => panic!("expected closed, got {other:?}"),
    }
    client.close().await;
}

#[tokio::test]
async fn abandoned_turn_does_not_leak_into_the_next_request() {
    let fake = FakeAppServer::new();
    let client = fake.client();
    client.ensure_started().await.expect("start");

    let mut stream = client
        .stream_turn("thr_new", "hi", None)
        .await
        .expect("turn/start");
    assert!(matches!(stream.next().await, Some(RawEvent::TurnStarted { .. })));
    drop(stream);

    // The rest of the abandoned turn is discarded by the next call.
    let started = client.thread_start(Some("gpt-5")).await.expect("thread/start");
    assert_eq!(started["thread"]["id"], "thr_new");
    assert!(client.is_alive());
    client.close().await;
}

#[tokio::test]
async fn exited_process_is_respawned_by_ensure_started() {
    let fake = FakeAppServer::new();
    let client = fake.client();
    client.ensure_started().await.expect("start");

    assert!(matches!(
        client.request("fake/exit", None).await,
        Err(ClientError::Closed { .. })
    ));
    assert!(!client.is_alive());

    client.ensure_started().await.expect("restart");
    assert!(client.is_alive());
    assert_eq!(fake.spawn_count(), 2);
    client.close().await;
    client.close().await;
    assert!(!client.is_alive());
}

#[tokio::test]
async fn requests_behind_a_stalled_turn_give_up_after_the_timeout() {
    let fake = FakeAppServer::new().with_env("FAKE_TURN", "stall");
    let client = fake.client_with(ClientOptions {
        api_key: None,
        request_timeout: Duration::from_millis(300),
        shutdown_grace: Duration::from_millis(500),
        turn_idle_timeout: None,
    });
    client.ensure_started().await.expect("start");

    let mut stream = client
        .stream_turn("thr_new", "hi", None)
        .await
        .expect("turn/start");
    assert!(matches!(stream.next().await, Some(RawEvent::TurnStarted { .. })));
    assert_eq!(
        stream.next().await.as_ref().and_then(RawEvent::method),
        Some("item/agentMessage/delta")
    );

    let waited = tokio::time::timeout(Duration::from_secs(5), client.thread_list(5, None))
        .await
        .expect("request must not hang");
    match waited {
        Err(err @ ClientError::Busy { .. }) => assert!(!err.is_fatal()),
        other => panic!("expected busy, got {other:?}"),
    }
    assert!(matches!(
        client.stream_turn("thr_new", "again", None).await,
        Err(ClientError::Busy { .. })
    ));

    drop(stream);
    let listed = client.thread_list(5, None).await.expect("thread/list");
    assert_eq!(listed["data"][0]["id"], "thr_1");
    client.close().await;
}

#[tokio::test]
async fn silent_turn_ends_after_the_idle_bound() {
    let fake = FakeAppServer::new().with_env("FAKE_TURN", "stall");
    let client = fake.client_with(ClientOptions {
        api_key: None,
        request_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(500),
        turn_idle_timeout: Some(Duration::from_millis(300)),
    });
    client.ensure_started().await.expect("start");

    let stream = client
        .stream_turn("thr_new", "hi", None)
        .await
        .expect("turn/start");
    let events: Vec<RawEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("stream must end");

    assert_eq!(events.len(), 3, "events: {events:?}");
    assert!(matches!(&events[2], RawEvent::Error { message, .. } if message == STALLED_MESSAGE));
    assert!(client.is_alive());

    let listed = client.thread_list(5, None).await.expect("thread/list");
    assert_eq!(listed["data"][0]["id"], "thr_1");
    client.close().await;
}

#[tokio::test]
async fn completions_of_other_turns_are_skipped_without_a_turn_id() {
    let fake = FakeAppServer::new().with_env("FAKE_TURN", "anonymous");
    let client = fake.client();
    client.ensure_started().await.expect("start");

    let stream = client
        .stream_turn("thr_new", "hi", None)
        .await
        .expect("turn/start");
    let events: Vec<RawEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("stream must end");

    let methods: Vec<&str> = events.iter().filter_map(RawEvent::method).collect();
    assert_eq!(
        methods,
        vec!["turn/started", "item/agentMessage/delta", "turn/completed"]
    );
    let RawEvent::Message(last) = &events[events.len() - 1] else {
        panic!("expected a completion last, got {events:?}");
    };
    assert_eq!(last["params"]["turn"]["id"], "turn_1");
    client.close().await;
}
