//! Inbound request routing.
//!
//! Requests are routed by `(operation, type of the first payload object)`.
//! PUSH messages go to every listener registered for their object type plus
//! every wildcard listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossline_core::errors::HANDLER_NOT_FOUND;
use crossline_core::{CrosslineError, Message, ObjectType, Operation, PayloadObject, Result};
use tracing::{error, warn};

use crate::session::Session;

/// Handles one `(operation, object type)` route.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Execute the request and return the response objects.
    async fn handle(&self, request: &Message, session: &Arc<Session>)
    -> Result<Vec<PayloadObject>>;
}

/// Receives inbound PUSH messages.
#[async_trait]
pub trait PushListener: Send + Sync {
    /// Called once per matching push, in arrival order.
    async fn on_push(&self, push: &Message);
}

/// Routing table for inbound requests and pushes.
pub struct HandlerRegistry {
    handlers: HashMap<(Operation, ObjectType), Arc<dyn RequestHandler>>,
    listeners: Vec<(Option<ObjectType>, Arc<dyn PushListener>)>,
    handler_timeout: Duration,
}

impl HandlerRegistry {
    /// Default upper bound on a single handler invocation.
    pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            listeners: Vec::new(),
            handler_timeout: Self::DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Override the handler timeout.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Register a handler for a route, replacing any previous one.
    pub fn register(
        &mut self,
        operation: Operation,
        object_type: ObjectType,
        handler: impl RequestHandler + 'static,
    ) {
        let _ = self
            .handlers
            .insert((operation, object_type), Arc::new(handler));
    }

    /// Register a shared handler for a route.
    pub fn register_shared(
        &mut self,
        operation: Operation,
        object_type: ObjectType,
        handler: Arc<dyn RequestHandler>,
    ) {
        let _ = self.handlers.insert((operation, object_type), handler);
    }

    /// Add a push listener; `None` listens to every object type.
    pub fn add_listener(
        &mut self,
        object_type: Option<ObjectType>,
        listener: impl PushListener + 'static,
    ) {
        self.listeners.push((object_type, Arc::new(listener)));
    }

    /// Whether a route has a handler.
    pub fn has_route(&self, operation: Operation, object_type: ObjectType) -> bool {
        self.handlers.contains_key(&(operation, object_type))
    }

    /// All registered routes, sorted for stable output.
    pub fn routes(&self) -> Vec<(Operation, ObjectType)> {
        let mut routes: Vec<_> = self.handlers.keys().copied().collect();
        routes.sort_by_key(|(op, ty)| (op.to_string(), *ty));
        routes
    }

    /// Route a REQUEST to its handler.
    pub async fn dispatch(
        &self,
        request: &Message,
        session: &Arc<Session>,
    ) -> Result<Vec<PayloadObject>> {
        let operation = request.operation();
        let Some(object_type) = request.object_type() else {
            return Err(CrosslineError::validation(
                "request carries no payload objects",
            ));
        };
        let Some(handler) = self.handlers.get(&(operation, object_type)) else {
            return Err(CrosslineError::business(
                HANDLER_NOT_FOUND,
                format!("no handler for {operation} {object_type}"),
            ));
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.handler_timeout, handler.handle(request, session))
            .await
            .unwrap_or_else(|_elapsed| {
                error!(%operation, %object_type, "handler timed out after {:?}", self.handler_timeout);
                Err(CrosslineError::internal(format!(
                    "handler for {operation} {object_type} timed out"
                )))
            });

        let elapsed = start.elapsed();
        if elapsed.as_secs() >= 5 {
            warn!(
                %operation,
                %object_type,
                duration_secs = elapsed.as_secs_f64(),
                "slow request handler"
            );
        }
        result
    }

    /// Deliver a PUSH to matching listeners. Returns how many were invoked.
    pub async fn deliver_push(&self, push: &Message) -> usize {
        let object_type = push.object_type();
        let mut delivered = 0;
        for (filter, listener) in &self.listeners {
            if filter.is_none() || *filter == object_type {
                listener.on_push(push).await;
                delivered += 1;
            }
        }
        delivered
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
