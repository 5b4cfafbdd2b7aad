//! Middleware pipeline
//!
//! handle(request, next) middleware over axum request/response types.
//! The guard observes the produced response as a return value; nothing
//! mutates response objects in place.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;

/// Type alias for the boxed future a middleware chain step returns
pub type NextFuture<'a> = Pin<Box<dyn Future<Output = Response> + Send + 'a>>;

/// The rest of the middleware chain
pub struct Next {
    handler: Box<dyn FnOnce(Request) -> NextFuture<'static> + Send>,
}

impl Next {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnOnce(Request) -> NextFuture<'static> + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Run the rest of the chain with the given request
    pub async fn run(self, request: Request) -> Response {
        (self.handler)(request).await
    }
}

/// Middleware trait with the handle(request, next) pattern
pub trait Middleware: Send + Sync {
    /// Handle the request and call the next middleware in the chain
    fn handle(&self, request: Request, next: Next) -> NextFuture<'static>;

    /// Optional middleware name for debugging
    fn name(&self) -> &'static str {
        "Middleware"
    }
}

/// Composable middleware pipeline; middleware run in registration order
#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// Add middleware to the pipeline
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Execute the pipeline with a final handler
    pub async fn execute<F, Fut>(&self, request: Request, handler: F) -> Response
    where
        F: FnOnce(Request) -> Fut + Send + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let mut chain = Box::new(move |req: Request| Box::pin(handler(req)) as NextFuture<'static>)
            as Box<dyn FnOnce(Request) -> NextFuture<'static> + Send>;

        for middleware in self.middleware.iter().rev() {
            let middleware = middleware.clone();
            let next_handler = chain;
            chain = Box::new(move |req: Request| {
                let next = Next::new(next_handler);
                middleware.handle(req, next)
            });
        }

        chain(request).await
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Middleware names for debugging
    pub fn names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }
}
