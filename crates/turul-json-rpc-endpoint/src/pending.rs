//! Locally-initiated requests awaiting their response.
//!
//! Each request is a small state machine, `Pending -> Resolved | Cancelled`,
//! held in a `watch` channel. Transitions only ever leave `Pending`, so the
//! first of "response arrived" and "cancel" wins and every later attempt is a
//! no-op.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::endpoint::Shared;
use crate::error::JsonRpcErrorObject;
use crate::events::LogLevel;
use crate::types::RequestId;

/// What a wait on a [`PendingRequest`] observes
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The peer answered with a result
    Result(Value),
    /// The peer answered with an error object (passed through untouched)
    Error(JsonRpcErrorObject),
    /// The request was cancelled locally before a response arrived
    Cancelled,
}

impl RequestOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestOutcome::Cancelled)
    }

    /// The result value, if the peer answered successfully
    pub fn result(&self) -> Option<&Value> {
        match self {
            RequestOutcome::Result(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JsonRpcErrorObject> {
        match self {
            RequestOutcome::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl From<Result<Value, JsonRpcErrorObject>> for RequestOutcome {
    fn from(result: Result<Value, JsonRpcErrorObject>) -> Self {
        match result {
            Ok(value) => RequestOutcome::Result(value),
            Err(error) => RequestOutcome::Error(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestState {
    Pending,
    Resolved(Result<Value, JsonRpcErrorObject>),
    Cancelled,
}

impl RequestState {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestState::Pending)
    }

    /// The terminal outcome, `None` while still pending
    pub fn outcome(&self) -> Option<RequestOutcome> {
        match self {
            RequestState::Pending => None,
            RequestState::Resolved(result) => Some(result.clone().into()),
            RequestState::Cancelled => Some(RequestOutcome::Cancelled),
        }
    }
}

/// Registry-side record of one outstanding request
#[derive(Debug)]
pub(crate) struct PendingEntry {
    pub(crate) id: RequestId,
    pub(crate) method: String,
    pub(crate) started_at: DateTime<Utc>,
    state: watch::Sender<RequestState>,
}

impl PendingEntry {
    pub(crate) fn new(id: RequestId, method: String, started_at: DateTime<Utc>) -> Self {
        let (state, _) = watch::channel(RequestState::Pending);
        Self {
            id,
            method,
            started_at,
            state,
        }
    }

    /// Move out of `Pending`. Returns `true` only for the call that did it.
    pub(crate) fn transition(&self, next: RequestState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_pending() {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn state(&self) -> RequestState {
        self.state.borrow().clone()
    }

    async fn settled(&self) -> RequestOutcome {
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.outcome(),
            // The sender lives in this entry, so it cannot be gone while we borrow it
            Err(_) => None,
        };
        outcome.unwrap_or(RequestOutcome::Cancelled)
    }
}

/// Table of outstanding requests keyed by id
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    entries: Mutex<HashMap<RequestId, Arc<PendingEntry>>>,
}

impl PendingRequests {
    pub(crate) fn register(&self, entry: Arc<PendingEntry>) {
        self.entries.lock().insert(entry.id.clone(), entry);
    }

    pub(crate) fn remove(&self, id: &RequestId) -> Option<Arc<PendingEntry>> {
        self.entries.lock().remove(id)
    }

    /// Deliver a response. Returns the entry when it was still pending,
    /// `None` when the response is unmatched (unknown, duplicate or already
    /// cancelled).
    pub(crate) fn resolve(
        &self,
        id: &RequestId,
        result: Result<Value, JsonRpcErrorObject>,
    ) -> Option<Arc<PendingEntry>> {
        let entry = self.remove(id)?;
        entry
            .transition(RequestState::Resolved(result))
            .then_some(entry)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Handle to a request sent with `Endpoint::send_request`.
///
/// Cloning the handle shares the same underlying request. Awaiting the handle
/// directly is the same as [`PendingRequest::wait`].
#[derive(Clone)]
pub struct PendingRequest {
    entry: Arc<PendingEntry>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.entry.id)
            .field("method", &self.entry.method)
            .field("state", &self.entry.state())
            .finish()
    }
}

impl PendingRequest {
    pub(crate) fn new(entry: Arc<PendingEntry>, shared: Arc<Shared>) -> Self {
        Self { entry, shared }
    }

    pub fn id(&self) -> &RequestId {
        &self.entry.id
    }

    pub fn method(&self) -> &str {
        &self.entry.method
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.entry.started_at
    }

    pub fn state(&self) -> RequestState {
        self.entry.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state().is_pending()
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state(), RequestState::Resolved(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), RequestState::Cancelled)
    }

    /// Wait until the request is resolved or cancelled
    pub async fn wait(&self) -> RequestOutcome {
        self.entry.settled().await
    }

    /// Wait at most `timeout`; `None` if the request is still pending afterwards
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<RequestOutcome> {
        tokio::time::timeout(timeout, self.entry.settled()).await.ok()
    }

    /// Wait at most `timeout`, returning `fallback` if nothing arrived in time.
    /// The request stays pending.
    pub async fn wait_or(&self, timeout: Duration, fallback: RequestOutcome) -> RequestOutcome {
        self.wait_timeout(timeout).await.unwrap_or(fallback)
    }

    /// Wait at most `timeout`; on expiry cancel the request and return `fallback`.
    ///
    /// Safe to call repeatedly and concurrently with [`PendingRequest::cancel`]:
    /// the request is cancelled, and the peer notified, at most once. If a
    /// response wins the race against the timeout it is returned instead.
    pub async fn wait_or_cancel(
        &self,
        timeout: Duration,
        fallback: RequestOutcome,
    ) -> RequestOutcome {
        if let Some(outcome) = self.wait_timeout(timeout).await {
            return outcome;
        }
        self.cancel().await;
        match self.state() {
            RequestState::Resolved(result) => result.into(),
            _ => fallback,
        }
    }

    /// Cancel the request.
    ///
    /// Returns `true` if this call performed the cancellation; `false` if the
    /// request had already been resolved or cancelled. Only the winning call
    /// removes the registry entry and sends the cancellation notification.
    pub async fn cancel(&self) -> bool {
        if !self.entry.transition(RequestState::Cancelled) {
            return false;
        }
        self.shared.pending.remove(&self.entry.id);
        self.shared.events.log(
            LogLevel::Debug,
            format!(
                "Cancelled request {} ({})",
                self.entry.id, self.entry.method
            ),
            None,
        );

        let cancel_method = self.shared.config.cancel_method.clone();
        let params = json!({ "id": self.entry.id });
        if let Err(e) = self.shared.notify(cancel_method, params).await {
            self.shared.events.log(
                LogLevel::Warn,
                format!("Could not notify peer of cancelled request {}", self.entry.id),
                Some(e.to_string()),
            );
        }
        true
    }
}

impl IntoFuture for PendingRequest {
    type Output = RequestOutcome;
    type IntoFuture = BoxFuture<'static, RequestOutcome>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}
