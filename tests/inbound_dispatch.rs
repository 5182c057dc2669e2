//! Inbound requests and notifications: handler outcomes, malformed input and
//! peer-initiated cancellation

use std::sync::Arc;
use std::time::Duration;

use endpoint_test_support::{error_of, init_tracing, next_message, notification, request, wait_for_event};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use turul_json_rpc_endpoint::prelude::*;

/// Notifications seen by the test handlers
type Seen = mpsc::UnboundedSender<String>;

fn endpoint() -> (Endpoint<Seen>, PeerIo, mpsc::UnboundedReceiver<String>) {
    let (io, peer) = ChannelTransport::pair(16);
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let endpoint = Endpoint::<Seen>::builder()
        .parallelism(2)
        .on_request("echo", |_ctx, params| async move {
            Ok::<_, HandlerError>(params.map(RequestParams::into_value).unwrap_or(Value::Null))
        })
        .on_request("reject", |_ctx, _params| async move {
            Err::<Value, _>(HandlerError::rpc(-32001, "Rejected", Some(json!({"retry": false}))))
        })
        .on_request("fault", |_ctx, _params| async move {
            Err::<Value, _>(HandlerError::fault("backend unavailable"))
        })
        .on_request("panic", |_ctx, _params| async move {
            let values: Vec<u32> = Vec::new();
            Ok::<_, HandlerError>(json!(values[3]))
        })
        .on_request("block", |_ctx, _params| async move {
            futures::future::pending::<()>().await;
            Ok::<_, HandlerError>(Value::Null)
        })
        .on_notification("note", |seen: Arc<Seen>, params| async move {
            let text = params
                .as_ref()
                .and_then(|p| p.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let _ = seen.send(text);
            Ok::<_, HandlerError>(())
        })
        .on_notification("broken", |_ctx, _params| async move {
            Err::<(), _>(HandlerError::fault("could not apply"))
        })
        .build(io.inbound, io.outbound);
    endpoint.start(seen_tx).unwrap();
    (endpoint, peer, seen_rx)
}

#[tokio::test]
async fn test_unknown_method_gets_method_not_found() {
    init_tracing();
    let (endpoint, mut peer, _seen) = endpoint();

    peer.send(request(1, "does/not/exist", Value::Null)).await.unwrap();
    let reply = next_message(&mut peer).await.unwrap();

    assert_eq!(reply.id(), Some(&RequestId::Number(1)));
    let error = error_of(&reply).unwrap();
    assert_eq!(error.code, METHOD_NOT_FOUND);
    assert!(error.message.contains("does/not/exist"));
    assert_eq!(error.data, Some(json!({"method": "does/not/exist"})));
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_string_ids_are_echoed() {
    let (endpoint, mut peer, _seen) = endpoint();

    peer.send(json!({"jsonrpc": "2.0", "id": "abc-1", "method": "echo", "params": ["x"]}))
        .await
        .unwrap();
    match next_message(&mut peer).await.unwrap() {
        Message::Response(resp) => {
            assert_eq!(resp.id, RequestId::String("abc-1".into()));
            assert_eq!(resp.result.into_value(), json!(["x"]));
        }
        other => panic!("unexpected message {other:?}"),
    }
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_application_errors_pass_through() {
    let (endpoint, mut peer, _seen) = endpoint();

    peer.send(request(2, "reject", Value::Null)).await.unwrap();
    let reply = next_message(&mut peer).await.unwrap();
    let error = error_of(&reply).unwrap();
    assert_eq!(error.code, -32001);
    assert_eq!(error.message, "Rejected");
    assert_eq!(error.data, Some(json!({"retry": false})));
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_faults_and_panics_become_internal_errors() {
    let (endpoint, mut peer, _seen) = endpoint();

    peer.send(request(3, "fault", Value::Null)).await.unwrap();
    peer.send(request(4, "panic", Value::Null)).await.unwrap();
    peer.send(request(5, "echo", json!({"still": "alive"}))).await.unwrap();

    let fault = next_message(&mut peer).await.unwrap();
    assert_eq!(fault.id(), Some(&RequestId::Number(3)));
    let error = error_of(&fault).unwrap();
    assert_eq!(error.code, INTERNAL_ERROR);
    assert_eq!(error.data.as_ref().unwrap()["reason"], "backend unavailable");

    let panicked = next_message(&mut peer).await.unwrap();
    assert_eq!(panicked.id(), Some(&RequestId::Number(4)));
    assert_eq!(error_of(&panicked).unwrap().code, INTERNAL_ERROR);

    match next_message(&mut peer).await.unwrap() {
        Message::Response(resp) => assert_eq!(resp.result.into_value(), json!({"still": "alive"})),
        other => panic!("unexpected message {other:?}"),
    }
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_malformed_input_is_reported_without_stopping() {
    let (endpoint, mut peer, _seen) = endpoint();
    let mut events = endpoint.subscribe();

    peer.to_endpoint
        .send(Err(TransportError::Protocol("truncated frame".into())))
        .await
        .unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, EndpointEvent::Log(log) if log.level == LogLevel::Error)
    })
    .await
    .unwrap();

    // Unrecoverable id: logged, no reply
    peer.send(json!(42)).await.unwrap();
    peer.send(json!([request(6, "echo", Value::Null)])).await.unwrap();
    // Recoverable id: InvalidRequest carrying it
    peer.send(json!({"jsonrpc": "2.0", "id": 7, "method": "echo", "params": 3}))
        .await
        .unwrap();
    peer.send(json!({"jsonrpc": "1.0", "id": 8, "method": "echo"}))
        .await
        .unwrap();
    peer.send(request(9, "echo", json!(["ok"]))).await.unwrap();

    for expected in [7, 8] {
        let reply = next_message(&mut peer).await.unwrap();
        assert_eq!(reply.id(), Some(&RequestId::Number(expected)));
        assert_eq!(error_of(&reply).unwrap().code, INVALID_REQUEST);
    }
    match next_message(&mut peer).await.unwrap() {
        Message::Response(resp) => assert_eq!(resp.id, RequestId::Number(9)),
        other => panic!("unexpected message {other:?}"),
    }
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_notifications_never_get_replies() {
    let (endpoint, mut peer, mut seen) = endpoint();

    peer.send(notification("note", json!({"text": "hello"}))).await.unwrap();
    peer.send(notification("unknown", json!({}))).await.unwrap();
    peer.send(notification("broken", json!({}))).await.unwrap();
    peer.send(request(10, "echo", json!([1]))).await.unwrap();

    assert_eq!(seen.recv().await.as_deref(), Some("hello"));
    let reply = next_message(&mut peer).await.unwrap();
    assert_eq!(reply.id(), Some(&RequestId::Number(10)));
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_peer_can_cancel_a_running_request() {
    let (endpoint, mut peer, _seen) = endpoint();

    peer.send(request(11, "block", Value::Null)).await.unwrap();
    peer.send(notification(CANCEL_METHOD, json!({"id": 11})))
        .await
        .unwrap();

    let reply = next_message(&mut peer).await.unwrap();
    assert_eq!(reply.id(), Some(&RequestId::Number(11)));
    let error = error_of(&reply).unwrap();
    assert_eq!(error.code, REQUEST_CANCELLED);
    assert_eq!(error.data, Some(json!({"id": 11, "method": "block"})));
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_cancel_reaches_handlers_when_every_permit_is_taken() {
    let (endpoint, mut peer, _seen) = endpoint();

    // parallelism is 2: both permits block, a third request waits for one
    peer.send(request(12, "block", Value::Null)).await.unwrap();
    peer.send(request(13, "block", Value::Null)).await.unwrap();
    peer.send(request(14, "echo", json!(["queued"]))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    peer.send(notification(CANCEL_METHOD, json!({"id": 12}))).await.unwrap();
    peer.send(notification(CANCEL_METHOD, json!({"id": 13}))).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(next_message(&mut peer).await.unwrap().id().cloned());
    }
    assert_eq!(
        ids,
        vec![
            Some(RequestId::Number(12)),
            Some(RequestId::Number(13)),
            Some(RequestId::Number(14)),
        ]
    );
    endpoint.shutdown().await;
}

#[tokio::test]
async fn test_cancel_reaches_requests_still_waiting_for_a_worker() {
    let (endpoint, mut peer, _seen) = endpoint();

    // Both permits block; 22 is pulled but has no worker yet
    peer.send(request(20, "block", Value::Null)).await.unwrap();
    peer.send(request(21, "block", Value::Null)).await.unwrap();
    peer.send(request(22, "block", Value::Null)).await.unwrap();
    peer.send(notification(CANCEL_METHOD, json!({"id": 22}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.send(notification(CANCEL_METHOD, json!({"id": 20}))).await.unwrap();
    peer.send(notification(CANCEL_METHOD, json!({"id": 21}))).await.unwrap();

    for expected in [20, 21, 22] {
        let reply = next_message(&mut peer).await.unwrap();
        assert_eq!(reply.id(), Some(&RequestId::Number(expected)));
        let error = error_of(&reply).unwrap();
        assert_eq!(error.code, REQUEST_CANCELLED);
        assert_eq!(error.data, Some(json!({"id": expected, "method": "block"})));
    }
    endpoint.shutdown().await;
}

const CANCEL_METHOD: &str = turul_json_rpc_endpoint::CANCEL_REQUEST_METHOD;
