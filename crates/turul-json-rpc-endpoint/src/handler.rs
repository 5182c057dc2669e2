use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::request::RequestParams;

/// Answers one request method.
///
/// `C` is the application context handed to `Endpoint::start`; every handler
/// invocation receives a shared reference-counted copy of it.
#[async_trait]
pub trait RequestHandler<C>: Send + Sync
where
    C: Send + Sync + 'static,
{
    async fn handle(
        &self,
        context: Arc<C>,
        params: Option<RequestParams>,
    ) -> Result<Value, HandlerError>;
}

/// Reacts to one notification method. There is no reply channel, so errors
/// are only logged.
#[async_trait]
pub trait NotificationHandler<C>: Send + Sync
where
    C: Send + Sync + 'static,
{
    async fn handle(
        &self,
        context: Arc<C>,
        params: Option<RequestParams>,
    ) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(F);

#[async_trait]
impl<C, F, Fut> RequestHandler<C> for FnHandler<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Option<RequestParams>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        context: Arc<C>,
        params: Option<RequestParams>,
    ) -> Result<Value, HandlerError> {
        (self.0)(context, params).await
    }
}

#[async_trait]
impl<C, F, Fut> NotificationHandler<C> for FnHandler<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Option<RequestParams>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        context: Arc<C>,
        params: Option<RequestParams>,
    ) -> Result<(), HandlerError> {
        (self.0)(context, params).await
    }
}

/// Method-name keyed dispatch table, populated before the endpoint starts.
///
/// A lookup miss returns `None`; the endpoint turns that into `MethodNotFound`
/// for requests and a warning for notifications.
pub struct HandlerRegistry<C>
where
    C: Send + Sync + 'static,
{
    requests: HashMap<String, Arc<dyn RequestHandler<C>>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler<C>>>,
}

impl<C> HandlerRegistry<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            notifications: HashMap::new(),
        }
    }

    /// Register a handler for a request method, replacing any previous one
    pub fn register_request<H>(&mut self, method: impl Into<String>, handler: H)
    where
        H: RequestHandler<C> + 'static,
    {
        self.requests.insert(method.into(), Arc::new(handler));
    }

    /// Register a handler for a notification method, replacing any previous one
    pub fn register_notification<H>(&mut self, method: impl Into<String>, handler: H)
    where
        H: NotificationHandler<C> + 'static,
    {
        self.notifications.insert(method.into(), Arc::new(handler));
    }

    /// Register an async closure as a request handler
    pub fn on_request<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Arc<C>, Option<RequestParams>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register_request(method, FnHandler(handler));
    }

    /// Register an async closure as a notification handler
    pub fn on_notification<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Arc<C>, Option<RequestParams>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register_notification(method, FnHandler(handler));
    }

    pub fn request_handler(&self, method: &str) -> Option<Arc<dyn RequestHandler<C>>> {
        self.requests.get(method).cloned()
    }

    pub fn notification_handler(&self, method: &str) -> Option<Arc<dyn NotificationHandler<C>>> {
        self.notifications.get(method).cloned()
    }

    /// All registered request and notification method names, sorted
    pub fn registered_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .requests
            .keys()
            .chain(self.notifications.keys())
            .cloned()
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }
}

impl<C> Default for HandlerRegistry<C>
where
    C: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
