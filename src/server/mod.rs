//! Bridge between the handler chain and the Axum HTTP server.
//!
//! The chain itself is framework-agnostic; this module is the one place
//! that touches server machinery, so applications (and the integration
//! tests) can put a recovered chain behind a real listener.

use std::io;

use axum::body::Body;
use axum::http::Request;
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;

use crate::context::{HandlerFunc, RequestContext};

/// Build a router that feeds every request through the handler chain.
///
/// `payload` constructs the per-request payload handed to the context.
pub fn into_router<V, P>(handler: HandlerFunc<V>, payload: P) -> Router
where
    V: Send + 'static,
    P: Fn() -> V + Clone + Send + Sync + 'static,
{
    let service = move |request: Request<Body>| {
        let handler = handler.clone();
        let payload = payload.clone();
        async move {
            let mut ctx = RequestContext::new(request, payload());
            handler(&mut ctx).await;
            ctx.into_response()
        }
    };
    Router::new()
        .route("/", any(service.clone()))
        .route("/{*path}", any(service))
}

/// Serve the router until the listener is closed.
pub async fn serve(listener: TcpListener, router: Router) -> io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "recovery chain serving");
    axum::serve(listener, router).await
}
