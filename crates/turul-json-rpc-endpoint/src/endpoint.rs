//! The endpoint: lifecycle, outbound sends and inbound dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::classify::InboundMessage;
use crate::clock::{Clock, SystemClock};
use crate::config::EndpointConfig;
use crate::error::{EndpointError, HandlerError, JsonRpcError, JsonRpcErrorObject};
use crate::events::{EndpointEvent, EventSink, LogLevel, TraceEvent};
use crate::handler::{HandlerRegistry, NotificationHandler, RequestHandler};
use crate::message::Message;
use crate::notification::JsonRpcNotification;
use crate::pending::{PendingEntry, PendingRequest, PendingRequests, RequestState};
use crate::pipeline;
use crate::request::{JsonRpcRequest, RequestParams};
use crate::response::JsonRpcResponse;
use crate::transport::{InboundStream, Outbound};
use crate::types::RequestId;

/// How the endpoint finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// In-flight work drained and the outbound side was closed
    Completed,
    /// Draining exceeded `shutdown_timeout`; the outbound side was closed anyway
    TimedOut,
    /// The endpoint was dropped without ever shutting down
    Abandoned,
}

/// A response delivered to [`Endpoint::receive_response`]
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingResponse {
    pub id: RequestId,
    pub result: Result<Value, JsonRpcErrorObject>,
}

impl IncomingResponse {
    pub fn result(id: RequestId, value: Value) -> Self {
        Self {
            id,
            result: Ok(value),
        }
    }

    pub fn error(id: RequestId, error: JsonRpcErrorObject) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }

    /// Extract a response from a classified inbound message
    pub fn from_inbound(message: InboundMessage) -> Option<Self> {
        match message {
            InboundMessage::ResponseResult { id, result } => Some(Self::result(id, result)),
            InboundMessage::ResponseError { id, error } => Some(Self::error(id, error)),
            _ => None,
        }
    }
}

/// Completion signal returned by [`Endpoint::start`].
///
/// Resolves exactly once, after the endpoint has fully shut down.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<ShutdownStatus>>,
}

impl Completion {
    pub async fn wait(&self) -> ShutdownStatus {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(status) => status.unwrap_or(ShutdownStatus::Completed),
            Err(_) => ShutdownStatus::Abandoned,
        }
    }

    pub fn status(&self) -> Option<ShutdownStatus> {
        *self.rx.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_some()
    }
}

/// State shared by the endpoint, its pipeline and every pending-request handle
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: EndpointConfig,
    pub(crate) events: EventSink,
    pub(crate) outbound: Outbound,
    pub(crate) pending: PendingRequests,
    next_id: AtomicI64,
    next_generation: AtomicU64,
    /// Inbound requests still being answered, newest last for each id
    in_flight: Mutex<HashMap<RequestId, Vec<Tracked>>>,
}

/// Cancellation token of one inbound request, told apart from other requests
/// reusing its id by a generation number
#[derive(Debug, Clone)]
pub(crate) struct Tracked {
    generation: u64,
    pub(crate) token: CancellationToken,
}

impl Shared {
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request(
        self: &Arc<Self>,
        method: String,
        params: Option<RequestParams>,
    ) -> Result<PendingRequest, EndpointError> {
        let id = self.next_id();
        let entry = Arc::new(PendingEntry::new(
            id.clone(),
            method.clone(),
            self.events.now(),
        ));
        // Registered before the request is handed to the transport, so a
        // reply can never arrive ahead of its entry.
        self.pending.register(entry.clone());
        self.events.trace(TraceEvent::SendRequest {
            id: id.clone(),
            method: method.clone(),
            at: entry.started_at,
        });

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.outbound.send(request.into()).await {
            self.pending.remove(&id);
            entry.transition(RequestState::Cancelled);
            return Err(e);
        }
        Ok(PendingRequest::new(entry, self.clone()))
    }

    pub(crate) async fn notify(&self, method: String, params: Value) -> Result<(), EndpointError> {
        let params = to_params(params)?;
        self.events.trace(TraceEvent::SendNotification {
            method: method.clone(),
            at: self.events.now(),
        });
        self.outbound
            .send(JsonRpcNotification::new(method, params).into())
            .await
    }

    pub(crate) fn receive_response(&self, response: IncomingResponse) -> bool {
        let IncomingResponse { id, result } = response;
        let error = result.as_ref().err().cloned();
        match self.pending.resolve(&id, result) {
            Some(entry) => {
                let at = self.events.now();
                self.events.trace(TraceEvent::ReceiveResponse {
                    id,
                    method: entry.method.clone(),
                    at,
                    latency_ms: (at - entry.started_at).num_milliseconds(),
                    error,
                });
                true
            }
            None => {
                self.events.log(
                    LogLevel::Debug,
                    format!("Received response for unmatched request {}", id),
                    None,
                );
                self.events.trace(TraceEvent::UnmatchedResponse {
                    id,
                    at: self.events.now(),
                });
                false
            }
        }
    }

    /// Make an inbound request cancellable by the peer until it has been answered
    pub(crate) fn track(&self, id: &RequestId) -> Tracked {
        let tracked = Tracked {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        self.in_flight
            .lock()
            .entry(id.clone())
            .or_default()
            .push(tracked.clone());
        tracked
    }

    /// Forget an answered request without touching others that reuse its id
    pub(crate) fn untrack(&self, id: &RequestId, tracked: &Tracked) {
        let mut in_flight = self.in_flight.lock();
        if let Some(entries) = in_flight.get_mut(id) {
            entries.retain(|entry| entry.generation != tracked.generation);
            if entries.is_empty() {
                in_flight.remove(id);
            }
        }
    }

    /// Handle an inbound cancellation notification for one of our running handlers
    pub(crate) fn cancel_inbound(&self, notification: &JsonRpcNotification) {
        let Some(id) = notification.get_param("id").and_then(RequestId::from_value) else {
            self.events.log(
                LogLevel::Warn,
                format!("Ignoring {} without a valid id", notification.method),
                None,
            );
            return;
        };
        match self.in_flight.lock().get(&id).and_then(|entries| entries.last()) {
            Some(tracked) => {
                tracked.token.cancel();
                self.events.log(
                    LogLevel::Debug,
                    format!("Peer cancelled request {}", id),
                    None,
                );
            }
            None => self.events.log(
                LogLevel::Debug,
                format!("Peer cancelled request {} which is not running", id),
                None,
            ),
        }
    }

    pub(crate) fn cancel_method(&self) -> &str {
        &self.config.cancel_method
    }
}

fn to_params(value: Value) -> Result<Option<RequestParams>, EndpointError> {
    match value {
        Value::Null => Ok(None),
        other => RequestParams::from_value(other)
            .map(Some)
            .ok_or(EndpointError::InvalidParams),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Everything an [`Endpoint`] handle points at; clones share one of these
struct EndpointInner<C>
where
    C: Send + Sync + 'static,
{
    shared: Arc<Shared>,
    handlers: HandlerRegistry<C>,
    inbound: Mutex<Option<InboundStream>>,
    started: AtomicBool,
    stop: CancellationToken,
    completion: watch::Sender<Option<ShutdownStatus>>,
}

impl<C> EndpointInner<C>
where
    C: Send + Sync + 'static,
{
    /// Record the final status. Only the first call has any effect; every
    /// call returns the recorded status.
    fn finish(&self, status: ShutdownStatus) -> ShutdownStatus {
        let mut recorded = status;
        self.completion.send_if_modified(|slot| match slot {
            Some(existing) => {
                recorded = *existing;
                false
            }
            None => {
                *slot = Some(status);
                true
            }
        });
        recorded
    }
}

/// A bidirectional JSON-RPC endpoint.
///
/// Cheap to clone; clones share the same connection, registry and lifecycle.
pub struct Endpoint<C>
where
    C: Send + Sync + 'static,
{
    inner: Arc<EndpointInner<C>>,
}

impl<C> Clone for Endpoint<C>
where
    C: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> Endpoint<C>
where
    C: Send + Sync + 'static,
{
    pub fn builder() -> EndpointBuilder<C> {
        EndpointBuilder::new()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.shared.config
    }

    /// Start pulling inbound messages through the pipeline.
    ///
    /// Must be called from within a Tokio runtime. The returned [`Completion`]
    /// resolves once the endpoint has shut down, either through
    /// [`Endpoint::shutdown`] or because the inbound transport closed.
    pub fn start(&self, context: C) -> Result<Completion, EndpointError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::AlreadyStarted);
        }
        let inbound = self
            .inner
            .inbound
            .lock()
            .take()
            .ok_or(EndpointError::AlreadyStarted)?;

        self.log(LogLevel::Info, "Starting JSON-RPC endpoint", None);
        let endpoint = self.clone();
        let context = Arc::new(context);
        let stop = self.inner.stop.clone();
        tokio::spawn(async move {
            pipeline::run(endpoint.clone(), context, inbound, stop).await;
            endpoint.inner.shared.outbound.close();
            endpoint.inner.finish(ShutdownStatus::Completed);
            endpoint.log(LogLevel::Info, "JSON-RPC endpoint stopped", None);
        });

        Ok(self.completion())
    }

    /// Stop reading, drain in-flight work, close the outbound side and
    /// resolve the completion signal.
    ///
    /// Bounded by `shutdown_timeout`. Calling it again returns the status
    /// recorded by the first call.
    pub async fn shutdown(&self) -> ShutdownStatus {
        if let Some(status) = *self.inner.completion.borrow() {
            return status;
        }
        self.log(LogLevel::Info, "Shutting down JSON-RPC endpoint", None);
        self.inner.stop.cancel();

        if !self.inner.started.load(Ordering::SeqCst) {
            self.inner.shared.outbound.close();
            return self.inner.finish(ShutdownStatus::Completed);
        }

        let timeout = self.inner.shared.config.shutdown_timeout;
        match tokio::time::timeout(timeout, self.completion().wait()).await {
            Ok(status) => status,
            Err(_) => {
                self.log(
                    LogLevel::Error,
                    format!("Timed out after {:?} waiting for in-flight work to drain", timeout),
                    None,
                );
                self.inner.shared.outbound.close();
                self.inner.finish(ShutdownStatus::TimedOut)
            }
        }
    }

    /// Wait for the endpoint to have fully shut down.
    ///
    /// Closes nothing itself; for protocols with a distinct exit step. Returns
    /// immediately if the endpoint was never started.
    pub async fn exit(&self) {
        if self.inner.started.load(Ordering::SeqCst) {
            let status = self.completion().wait().await;
            self.log(LogLevel::Debug, format!("Endpoint exited ({:?})", status), None);
        }
    }

    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.inner.completion.subscribe(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Number of locally-initiated requests still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Subscribe to the log/trace side channel
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Best-effort log on the side channel; never blocks
    pub fn log(&self, level: LogLevel, message: impl Into<String>, error: Option<String>) {
        self.inner.shared.events.log(level, message, error);
    }

    /// Send a request to the peer.
    ///
    /// `params` must serialize to an object, an array or `null`. Waits for
    /// outbound capacity but not for the reply.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: impl Serialize,
    ) -> Result<PendingRequest, EndpointError> {
        let params = to_params(serde_json::to_value(params)?)?;
        self.inner.shared.request(method.into(), params).await
    }

    /// Send a notification to the peer; no reply is expected
    pub async fn send_notification(
        &self,
        method: impl Into<String>,
        params: impl Serialize,
    ) -> Result<(), EndpointError> {
        let params = serde_json::to_value(params)?;
        self.inner.shared.notify(method.into(), params).await
    }

    /// Resolve the matching pending request. Returns `false` for an
    /// unmatched response, which is logged and discarded.
    pub fn receive_response(&self, response: IncomingResponse) -> bool {
        self.inner.shared.receive_response(response)
    }

    /// Run the handler for `request` and build the reply.
    ///
    /// Always produces exactly one response carrying the request id: a missing
    /// handler yields `MethodNotFound`, a handler fault or panic yields
    /// `InternalError`, and a peer cancellation yields `RequestCancelled`.
    pub async fn receive_request(&self, context: Arc<C>, request: JsonRpcRequest) -> Message {
        let tracked = self.inner.shared.track(&request.id);
        self.respond(context, request, tracked).await
    }

    /// Answer a request whose cancellation token is already tracked
    pub(crate) async fn respond(
        &self,
        context: Arc<C>,
        request: JsonRpcRequest,
        tracked: Tracked,
    ) -> Message {
        let shared = &self.inner.shared;
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let received_at = shared.events.now();
        shared.events.trace(TraceEvent::ReceiveRequest {
            id: id.clone(),
            method: method.clone(),
            at: received_at,
        });

        let response: Message = match self.inner.handlers.request_handler(&method) {
            None => {
                self.log(
                    LogLevel::Warn,
                    format!("Method not found: {}", method),
                    None,
                );
                JsonRpcError::method_not_found(id.clone(), &method).into()
            }
            Some(handler) => {
                let outcome = run_cancellable(&tracked.token, handler.handle(context, params)).await;
                match outcome {
                    None => JsonRpcError::request_cancelled(id.clone(), &method).into(),
                    Some(Ok(Ok(value))) => JsonRpcResponse::success(id.clone(), value).into(),
                    Some(Ok(Err(HandlerError::Rpc(error)))) => {
                        JsonRpcError::new(Some(id.clone()), error).into()
                    }
                    Some(Ok(Err(HandlerError::Fault(e)))) => {
                        self.internal_error(&id, &method, format!("{:#}", e))
                    }
                    Some(Err(panic)) => self.internal_error(&id, &method, panic_message(panic)),
                }
            }
        };

        shared.untrack(&id, &tracked);

        let error = match &response {
            Message::Error(err) => Some(err.error.clone()),
            _ => None,
        };
        let at = shared.events.now();
        shared.events.trace(TraceEvent::SendResponse {
            id,
            method,
            at,
            latency_ms: (at - received_at).num_milliseconds(),
            error,
        });
        response
    }

    fn internal_error(&self, id: &RequestId, method: &str, reason: String) -> Message {
        self.log(
            LogLevel::Error,
            format!("Error handling request {} ({})", id, method),
            Some(reason.clone()),
        );
        JsonRpcError::internal_error(
            Some(id.clone()),
            Some(json!({ "method": method, "reason": reason })),
        )
        .into()
    }

    /// Run the handler for `notification`. Missing handlers and failures are
    /// only logged; notifications never get a reply.
    pub async fn receive_notification(&self, context: Arc<C>, notification: JsonRpcNotification) {
        let shared = &self.inner.shared;
        shared.events.trace(TraceEvent::ReceiveNotification {
            method: notification.method.clone(),
            at: shared.events.now(),
        });

        let Some(handler) = self.inner.handlers.notification_handler(&notification.method) else {
            self.log(
                LogLevel::Warn,
                format!("No handler for notification {}", notification.method),
                None,
            );
            return;
        };

        let call = AssertUnwindSafe(handler.handle(context, notification.params)).catch_unwind();
        let failure = match call.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic),
        };
        self.log(
            LogLevel::Error,
            format!("Error handling notification {}", notification.method),
            Some(failure),
        );
    }

    /// Dispatch one classified inbound message; returns the reply to emit, if any
    pub async fn receive_message(&self, context: Arc<C>, message: InboundMessage) -> Option<Message> {
        match message {
            InboundMessage::Request(request) => Some(self.receive_request(context, request).await),
            InboundMessage::Notification(notification) => {
                if notification.method == self.inner.shared.cancel_method() {
                    self.inner.shared.cancel_inbound(&notification);
                } else {
                    self.receive_notification(context, notification).await;
                }
                None
            }
            InboundMessage::ResponseResult { .. } | InboundMessage::ResponseError { .. } => {
                if let Some(response) = IncomingResponse::from_inbound(message) {
                    self.receive_response(response);
                }
                None
            }
            InboundMessage::ParseError { reason } => {
                self.log(
                    LogLevel::Error,
                    "Error reading message",
                    Some(reason),
                );
                None
            }
            InboundMessage::InvalidRequest { id, reason } => {
                self.log(
                    LogLevel::Warn,
                    "Received invalid message",
                    Some(reason.clone()),
                );
                id.map(|id| JsonRpcError::invalid_request(Some(id), Some(reason)).into())
            }
        }
    }
}

async fn run_cancellable<F, T>(
    cancelled: &CancellationToken,
    call: F,
) -> Option<Result<T, Box<dyn Any + Send>>>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancelled.cancelled() => None,
        result = AssertUnwindSafe(call).catch_unwind() => Some(result),
    }
}

/// Builder for [`Endpoint`]
pub struct EndpointBuilder<C>
where
    C: Send + Sync + 'static,
{
    config: EndpointConfig,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry<C>,
}

impl<C> EndpointBuilder<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            config: EndpointConfig::default(),
            clock: Arc::new(SystemClock),
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    pub fn trace(mut self, enabled: bool) -> Self {
        self.config.trace = enabled;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn cancel_method(mut self, method: impl Into<String>) -> Self {
        self.config.cancel_method = method.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the handler table wholesale
    pub fn handlers(mut self, handlers: HandlerRegistry<C>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn register_request<H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: RequestHandler<C> + 'static,
    {
        self.handlers.register_request(method, handler);
        self
    }

    pub fn register_notification<H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: NotificationHandler<C> + 'static,
    {
        self.handlers.register_notification(method, handler);
        self
    }

    pub fn on_request<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<C>, Option<RequestParams>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers.on_request(method, handler);
        self
    }

    pub fn on_notification<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<C>, Option<RequestParams>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers.on_notification(method, handler);
        self
    }

    pub fn build(self, inbound: InboundStream, outbound: mpsc::Sender<Message>) -> Endpoint<C> {
        let events = EventSink::new(
            self.config.effective_event_capacity(),
            self.clock,
            self.config.trace,
        );
        let shared = Arc::new(Shared {
            config: self.config,
            events,
            outbound: Outbound::new(outbound),
            pending: PendingRequests::default(),
            next_id: AtomicI64::new(0),
            next_generation: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        });
        let (completion, _) = watch::channel(None);

        Endpoint {
            inner: Arc::new(EndpointInner {
                shared,
                handlers: self.handlers,
                inbound: Mutex::new(Some(inbound)),
                started: AtomicBool::new(false),
                stop: CancellationToken::new(),
                completion,
            }),
        }
    }
}

impl<C> Default for EndpointBuilder<C>
where
    C: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
