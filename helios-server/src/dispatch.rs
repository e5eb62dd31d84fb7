//! Method and topic dispatch seams.
//!
//! The coordinator hands parsed requests to a [`MethodRegistry`] and
//! inbound events to a [`TopicRouter`]. Both accept pluggable
//! `async_trait` handlers; [`method_fn`] and [`topic_fn`] adapt plain
//! async closures. Handler failures are captured into an error-shaped
//! response payload and never propagate further.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::warn;

use crate::connection::Connection;
use crate::error::HandlerError;

/// Context carried into every handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub connection: Arc<Connection>,
}

// ════════════════════════════════════════════════════════════════════
// Methods
// ════════════════════════════════════════════════════════════════════

/// An RPC method implementation.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: Option<Value>,
    ) -> Result<Value, HandlerError>;
}

struct FnMethodHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnMethodHandler<F>
where
    F: Fn(HandlerContext, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: Option<Value>,
    ) -> Result<Value, HandlerError> {
        (self.0)(ctx.clone(), payload).await
    }
}

/// Wraps an async closure as a [`MethodHandler`].
pub fn method_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(HandlerContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnMethodHandler(f))
}

/// Registered RPC methods, keyed by name.
#[derive(Default)]
pub struct MethodRegistry {
    methods: DashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one of the same name.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.methods.insert(name.into(), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Dispatches a request and always yields a response payload: the
    /// handler's value on success, an error shape on failure or for an
    /// unknown method.
    pub async fn dispatch(
        &self,
        ctx: &HandlerContext,
        method: &str,
        payload: Option<Value>,
    ) -> Value {
        let Some(handler) = self.methods.get(method).map(|entry| entry.value().clone()) else {
            return error_payload(format!("Method not found: {method}"));
        };

        match handler.handle(ctx, payload).await {
            Ok(value) => value,
            Err(err) => {
                warn!(%method, connection = %ctx.connection.id(), "method handler failed: {err}");
                error_payload(err.0)
            }
        }
    }
}

/// The payload shape used for dispatcher and handler failures.
pub fn error_payload(message: impl Into<String>) -> Value {
    json!({ "error": { "message": message.into() } })
}

// ════════════════════════════════════════════════════════════════════
// Topics
// ════════════════════════════════════════════════════════════════════

/// Handles inbound events whose topic matches a registered pattern.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, topic: &str, payload: Option<Value>);
}

struct FnTopicHandler<F>(F);

#[async_trait]
impl<F, Fut> TopicHandler for FnTopicHandler<F>
where
    F: Fn(HandlerContext, String, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, ctx: &HandlerContext, topic: &str, payload: Option<Value>) {
        (self.0)(ctx.clone(), topic.to_string(), payload).await
    }
}

/// Wraps an async closure as a [`TopicHandler`].
pub fn topic_fn<F, Fut>(f: F) -> Arc<dyn TopicHandler>
where
    F: Fn(HandlerContext, String, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnTopicHandler(f))
}

/// Routes inbound events to handlers by topic pattern, in registration
/// order.
#[derive(Default)]
pub struct TopicRouter {
    routes: Mutex<Vec<(String, Arc<dyn TopicHandler>)>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pattern: impl Into<String>, handler: Arc<dyn TopicHandler>) {
        self.routes.lock().unwrap().push((pattern.into(), handler));
    }

    /// Invokes every handler whose pattern matches `topic`.
    pub async fn route(&self, ctx: &HandlerContext, topic: &str, payload: Option<Value>) {
        let matching: Vec<Arc<dyn TopicHandler>> = {
            let routes = self.routes.lock().unwrap();
            routes
                .iter()
                .filter(|(pattern, _)| helios_protocol::topic_matches(pattern, topic))
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        for handler in matching {
            handler.handle(ctx, topic, payload.clone()).await;
        }
    }
}
