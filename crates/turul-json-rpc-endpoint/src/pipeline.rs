//! Ordered, bounded-concurrency inbound pipeline.
//!
//! A single reader pulls messages off the transport and hands each one to a
//! worker task together with a semaphore permit and a sequence number. Workers
//! finish in any order; the emitter buffers their replies and writes them to
//! the outbound side strictly in arrival order. A permit is released only
//! after its reply has been written, so a slow outbound consumer stalls the
//! emitter, which holds the permits, which stalls the reader.
//!
//! Responses and inbound cancellations are handled by the reader itself
//! without a permit. While it waits for a permit the reader keeps pulling, so
//! those still get through when every worker is busy. Messages that need a
//! worker are held in a backlog of at most `parallelism` entries meanwhile.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classify::{InboundMessage, classify};
use crate::endpoint::{Endpoint, IncomingResponse, Shared, Tracked};
use crate::events::LogLevel;
use crate::message::Message;
use crate::transport::InboundStream;

/// A finished unit of work waiting for its turn to be written
struct Completed {
    seq: u64,
    output: Option<Message>,
    permit: OwnedSemaphorePermit,
}

/// A message waiting for a worker. Requests are already cancellable.
type Queued = (InboundMessage, Option<Tracked>);

enum Pulled {
    /// Needs a worker
    Work(Queued),
    /// Dealt with inline
    Handled,
    /// Stop requested or transport closed; nothing more will be pulled
    Closed,
}

/// Sole consumer of the inbound stream
struct Reader<C>
where
    C: Send + Sync + 'static,
{
    endpoint: Endpoint<C>,
    inbound: InboundStream,
    stop: CancellationToken,
    open: bool,
}

impl<C> Reader<C>
where
    C: Send + Sync + 'static,
{
    /// Pull one message. Cancel-safe: nothing is awaited after the stream yields.
    async fn pull(&mut self) -> Pulled {
        let raw = tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                debug!("Stop requested, no longer reading inbound messages");
                self.open = false;
                return Pulled::Closed;
            }
            next = self.inbound.next() => match next {
                Some(raw) => raw,
                None => {
                    self.endpoint.log(LogLevel::Info, "Inbound transport closed", None);
                    self.open = false;
                    return Pulled::Closed;
                }
            },
        };

        let message = classify(raw);
        match message {
            InboundMessage::ResponseResult { .. } | InboundMessage::ResponseError { .. } => {
                if let Some(response) = IncomingResponse::from_inbound(message) {
                    self.endpoint.receive_response(response);
                }
                Pulled::Handled
            }
            InboundMessage::Notification(ref notification)
                if notification.method == self.endpoint.shared().cancel_method() =>
            {
                self.endpoint.shared().cancel_inbound(notification);
                Pulled::Handled
            }
            InboundMessage::Request(request) => {
                // Tracked before it can queue, so a cancellation that follows
                // right behind the request still finds it
                let tracked = self.endpoint.shared().track(&request.id);
                Pulled::Work((InboundMessage::Request(request), Some(tracked)))
            }
            message => Pulled::Work((message, None)),
        }
    }
}

/// Drive the inbound stream until it ends or `stop` fires, then wait for every
/// already-pulled message to be processed and its reply written.
pub(crate) async fn run<C>(
    endpoint: Endpoint<C>,
    context: Arc<C>,
    inbound: InboundStream,
    stop: CancellationToken,
) where
    C: Send + Sync + 'static,
{
    let parallelism = endpoint.config().effective_parallelism();
    let permits = Arc::new(Semaphore::new(parallelism));
    let (done_tx, done_rx) = mpsc::channel::<Completed>(parallelism);
    let emitter = tokio::spawn(emit(endpoint.shared().clone(), done_rx));

    let mut reader = Reader {
        endpoint: endpoint.clone(),
        inbound,
        stop,
        open: true,
    };
    let mut backlog: VecDeque<Queued> = VecDeque::with_capacity(parallelism);
    let mut seq: u64 = 0;

    loop {
        let (message, tracked) = match backlog.pop_front() {
            Some(work) => work,
            None if !reader.open => break,
            None => match reader.pull().await {
                Pulled::Work(work) => work,
                Pulled::Handled => continue,
                Pulled::Closed => break,
            },
        };

        // Once pulled, a message is always processed, even if `stop` fires meanwhile
        let permit = loop {
            if !reader.open || backlog.len() >= parallelism {
                break permits.clone().acquire_owned().await.ok();
            }
            tokio::select! {
                permit = permits.clone().acquire_owned() => break permit.ok(),
                pulled = reader.pull() => {
                    if let Pulled::Work(next) = pulled {
                        backlog.push_back(next);
                    }
                }
            }
        };
        let Some(permit) = permit else { break };

        let done = done_tx.clone();
        let endpoint = endpoint.clone();
        let context = context.clone();
        let this_seq = seq;
        seq += 1;

        tokio::spawn(async move {
            let dispatch = async {
                match (message, tracked) {
                    (InboundMessage::Request(request), Some(tracked)) => {
                        Some(endpoint.respond(context, request, tracked).await)
                    }
                    (message, _) => endpoint.receive_message(context, message).await,
                }
            };
            let output = match AssertUnwindSafe(dispatch).catch_unwind().await {
                Ok(output) => output,
                Err(_) => {
                    endpoint.log(LogLevel::Error, "Dispatch task panicked", None);
                    None
                }
            };
            let _ = done
                .send(Completed {
                    seq: this_seq,
                    output,
                    permit,
                })
                .await;
        });
    }

    drop(done_tx);
    if let Err(e) = emitter.await {
        endpoint.log(
            LogLevel::Error,
            "Reply emitter terminated abnormally",
            Some(e.to_string()),
        );
    }
}

/// Write replies in sequence order, releasing each permit once its reply is out
async fn emit(shared: Arc<Shared>, mut done: mpsc::Receiver<Completed>) {
    let mut next: u64 = 0;
    let mut ready: BTreeMap<u64, Completed> = BTreeMap::new();

    while let Some(completed) = done.recv().await {
        ready.insert(completed.seq, completed);

        while let Some(Completed { output, permit, .. }) = ready.remove(&next) {
            next += 1;
            if let Some(message) = output {
                if shared.outbound.is_closed() {
                    debug!(id = ?message.id(), "Outbound closed, dropping reply");
                } else if let Err(e) = shared.outbound.send(message).await {
                    shared.events.log(
                        LogLevel::Warn,
                        "Failed to write reply",
                        Some(e.to_string()),
                    );
                }
            }
            drop(permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use crate::endpoint::Endpoint;
    use crate::error::HandlerError;
    use crate::message::Message;
    use crate::transport::ChannelTransport;

    #[tokio::test(start_paused = true)]
    async fn test_replies_follow_arrival_order() {
        let (io, mut peer) = ChannelTransport::pair(16);
        let endpoint = Endpoint::<()>::builder()
            .parallelism(3)
            .on_request("sleep", |_ctx, params| async move {
                let ms = params
                    .as_ref()
                    .and_then(|p| p.get_index(0))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, HandlerError>(json!(ms))
            })
            .build(io.inbound, io.outbound);
        let completion = endpoint.start(()).unwrap();

        for (id, ms) in [(1, 30), (2, 10), (3, 20), (4, 0)] {
            peer.send(json!({"jsonrpc": "2.0", "id": id, "method": "sleep", "params": [ms]}))
                .await
                .unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..4 {
            match peer.recv().await {
                Some(Message::Response(resp)) => ids.push(resp.id.as_i64().unwrap()),
                other => panic!("unexpected output {other:?}"),
            }
        }
        assert_eq!(ids, vec![1, 2, 3, 4]);

        drop(peer.to_endpoint);
        completion.wait().await;
    }

    #[tokio::test]
    async fn test_transport_close_drains_and_closes_outbound() {
        let (io, mut peer) = ChannelTransport::pair(16);
        let endpoint = Endpoint::<()>::builder()
            .on_request("echo", |_ctx, params| async move {
                Ok::<_, HandlerError>(params.map(|p| p.into_value()).unwrap_or(Value::Null))
            })
            .build(io.inbound, io.outbound);
        let completion = endpoint.start(()).unwrap();

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"a": 1}}))
            .await
            .unwrap();
        drop(peer.to_endpoint);

        match peer.from_endpoint.recv().await {
            Some(Message::Response(resp)) => {
                assert_eq!(resp.result.into_value(), json!({"a": 1}))
            }
            other => panic!("unexpected output {other:?}"),
        }
        assert!(peer.from_endpoint.recv().await.is_none());
        completion.wait().await;
        assert!(completion.is_complete());
    }
}
