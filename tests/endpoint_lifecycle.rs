//! Start/shutdown/exit, side-channel events and endpoint-to-endpoint traffic

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use endpoint_test_support::{drain, init_tracing, next_message, request, wait_for_event};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use turul_json_rpc_endpoint::prelude::*;
use turul_json_rpc_endpoint::ManualClock;

#[tokio::test]
async fn test_shutdown_twice_resolves_completion_once() {
    init_tracing();
    let (io, mut peer) = ChannelTransport::pair(8);
    let endpoint = Endpoint::<()>::builder()
        .on_request("echo", |_ctx, params| async move {
            Ok::<_, HandlerError>(params.map(RequestParams::into_value).unwrap_or(Value::Null))
        })
        .build(io.inbound, io.outbound);
    let completion = endpoint.start(()).unwrap();
    assert!(endpoint.is_started());
    assert!(!completion.is_complete());

    peer.send(request(1, "echo", json!([1]))).await.unwrap();
    next_message(&mut peer).await.unwrap();

    let (first, second) = tokio::join!(endpoint.shutdown(), endpoint.shutdown());
    assert_eq!(first, ShutdownStatus::Completed);
    assert_eq!(second, ShutdownStatus::Completed);
    assert_eq!(endpoint.shutdown().await, ShutdownStatus::Completed);
    assert_eq!(completion.wait().await, ShutdownStatus::Completed);
    assert_eq!(completion.clone().wait().await, ShutdownStatus::Completed);
    endpoint.exit().await;

    // Outbound closed: the peer sees the end of the stream and sends fail
    assert!(peer.recv().await.is_none());
    assert!(matches!(
        endpoint.send_notification("late", Value::Null).await,
        Err(EndpointError::TransportClosed)
    ));
    assert!(matches!(
        endpoint.send_request("late", Value::Null).await,
        Err(EndpointError::TransportClosed)
    ));
    assert_eq!(endpoint.pending_count(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_work_already_pulled() {
    let (io, mut peer) = ChannelTransport::pair(8);
    let endpoint = Endpoint::<()>::builder()
        .parallelism(2)
        .on_request("slow", |_ctx, _params| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, HandlerError>(json!("done"))
        })
        .build(io.inbound, io.outbound);
    let completion = endpoint.start(()).unwrap();

    peer.send(request(1, "slow", Value::Null)).await.unwrap();
    peer.send(request(2, "slow", Value::Null)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(endpoint.shutdown().await, ShutdownStatus::Completed);
    let replies = drain(&mut peer).await;
    let ids: Vec<_> = replies.iter().filter_map(|m| m.id().cloned()).collect();
    assert_eq!(ids, vec![RequestId::Number(1), RequestId::Number(2)]);
    assert!(completion.is_complete());
}

#[tokio::test]
async fn test_shutdown_times_out_on_stuck_handlers() {
    let (io, mut peer) = ChannelTransport::pair(8);
    let endpoint = Endpoint::<()>::builder()
        .shutdown_timeout(Duration::from_millis(50))
        .on_request("stuck", |_ctx, _params| async move {
            futures::future::pending::<()>().await;
            Ok::<_, HandlerError>(Value::Null)
        })
        .build(io.inbound, io.outbound);
    let completion = endpoint.start(()).unwrap();

    peer.send(request(1, "stuck", Value::Null)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(endpoint.shutdown().await, ShutdownStatus::TimedOut);
    assert_eq!(completion.wait().await, ShutdownStatus::TimedOut);
    assert_eq!(endpoint.shutdown().await, ShutdownStatus::TimedOut);
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn test_transport_close_completes_the_endpoint() {
    let (io, peer) = ChannelTransport::pair(8);
    let endpoint = Endpoint::<()>::builder().build(io.inbound, io.outbound);
    let completion = endpoint.start(()).unwrap();

    drop(peer);
    assert_eq!(completion.wait().await, ShutdownStatus::Completed);
    endpoint.exit().await;
    assert_eq!(endpoint.shutdown().await, ShutdownStatus::Completed);
}

#[tokio::test]
async fn test_exit_before_start_returns_immediately() {
    let (io, _peer) = ChannelTransport::pair(8);
    let endpoint = Endpoint::<()>::builder().build(io.inbound, io.outbound);
    tokio::time::timeout(Duration::from_millis(100), endpoint.exit())
        .await
        .unwrap();
    assert!(!endpoint.is_started());
}

#[tokio::test]
async fn test_trace_events_measure_latency_with_the_injected_clock() {
    let start: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let (io, _peer) = ChannelTransport::pair(8);
    let endpoint = Endpoint::<()>::builder()
        .trace(true)
        .clock(clock.clone())
        .build(io.inbound, io.outbound);
    let mut events = endpoint.subscribe();

    let handle = endpoint
        .send_request("measure", json!({"n": 1}))
        .await
        .unwrap();
    assert_eq!(handle.started_at(), start);

    clock.advance(chrono::Duration::milliseconds(250));
    endpoint.receive_response(IncomingResponse::error(
        handle.id().clone(),
        JsonRpcErrorObject::application(7, "nope", None),
    ));

    match wait_for_event(&mut events, |e| matches!(e, EndpointEvent::Trace(TraceEvent::SendRequest { .. })))
        .await
        .unwrap()
    {
        EndpointEvent::Trace(TraceEvent::SendRequest { method, at, .. }) => {
            assert_eq!(method, "measure");
            assert_eq!(at, start);
        }
        other => panic!("unexpected event {other:?}"),
    }
    match wait_for_event(&mut events, |e| {
        matches!(e, EndpointEvent::Trace(TraceEvent::ReceiveResponse { .. }))
    })
    .await
    .unwrap()
    {
        EndpointEvent::Trace(TraceEvent::ReceiveResponse {
            latency_ms, error, ..
        }) => {
            assert_eq!(latency_ms, 250);
            assert_eq!(error.map(|e| e.code), Some(7));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_log_reaches_subscribers() {
    let (io, _peer) = ChannelTransport::pair(8);
    let endpoint = Endpoint::<()>::builder().build(io.inbound, io.outbound);
    let mut events = endpoint.subscribe();

    endpoint.log(LogLevel::Warn, "disk almost full", Some("93% used".into()));
    match events.recv().await.unwrap() {
        EndpointEvent::Log(log) => {
            assert_eq!(log.level, LogLevel::Warn);
            assert_eq!(log.message, "disk almost full");
            assert_eq!(log.error.as_deref(), Some("93% used"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Context for the "editor" side: collects notifications from the "server"
struct Editor {
    notes: mpsc::UnboundedSender<String>,
}

#[tokio::test]
async fn test_two_endpoints_talk_in_both_directions() {
    let (left, right) = ChannelTransport::connected(16);
    let (notes_tx, mut notes_rx) = mpsc::unbounded_channel();

    let server = Endpoint::<()>::builder()
        .on_request("upper", |_ctx, params| async move {
            let text: Vec<String> = params
                .ok_or_else(|| HandlerError::invalid_params("expected [text]"))?
                .parse()?;
            Ok::<_, HandlerError>(json!(text.concat().to_uppercase()))
        })
        .build(left.inbound, left.outbound);

    let editor = Endpoint::<Editor>::builder()
        .on_request("workspace/name", |_ctx, _params| async move {
            Ok::<_, HandlerError>(json!("demo"))
        })
        .on_notification("window/note", |editor: Arc<Editor>, params| async move {
            let note = params
                .and_then(|p| p.get("text").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            let _ = editor.notes.send(note);
            Ok::<_, HandlerError>(())
        })
        .build(right.inbound, right.outbound);

    let server_done = server.start(()).unwrap();
    let editor_done = editor.start(Editor { notes: notes_tx }).unwrap();

    let upper = editor.send_request("upper", json!(["a", "b"])).await.unwrap();
    let name = server.send_request("workspace/name", Value::Null).await.unwrap();
    server
        .send_notification("window/note", json!({"text": "ready"}))
        .await
        .unwrap();

    assert_eq!(upper.await, RequestOutcome::Result(json!("AB")));
    assert_eq!(name.await, RequestOutcome::Result(json!("demo")));
    assert_eq!(notes_rx.recv().await.as_deref(), Some("ready"));

    let missing = editor.send_request("nope", Value::Null).await.unwrap();
    match missing.await {
        RequestOutcome::Error(error) => assert_eq!(error.code, METHOD_NOT_FOUND),
        other => panic!("unexpected outcome {other:?}"),
    }

    // Closing one side ends the other's inbound stream
    assert_eq!(editor.shutdown().await, ShutdownStatus::Completed);
    assert_eq!(server_done.wait().await, ShutdownStatus::Completed);
    assert_eq!(editor_done.wait().await, ShutdownStatus::Completed);
}
