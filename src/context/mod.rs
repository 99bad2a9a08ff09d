//! Handler-chain contract: request context, handler and middleware types.
//!
//! # Responsibilities
//! - Carry the inbound request, the buffered response writer, and a
//!   caller-defined per-request payload through the chain
//! - Define the handler and middleware function shapes middlewares compose over
//! - Provide the structured JSON error response used by the recovery boundary

use std::panic::panic_any;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::Response;
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::recovery::fault::ClientAbort;

/// Shared asynchronous handler invoked with mutable access to the request context.
pub type HandlerFunc<V> =
    Arc<dyn for<'a> Fn(&'a mut RequestContext<V>) -> BoxFuture<'a, ()> + Send + Sync>;

/// Transforms a handler into a wrapped handler with the same calling convention,
/// so stages compose by plain function application.
pub type MiddlewareFunc<V> = Box<dyn Fn(HandlerFunc<V>) -> HandlerFunc<V> + Send + Sync>;

/// Wrap a plain function as a shareable handler.
pub fn handler<V, F>(f: F) -> HandlerFunc<V>
where
    F: for<'a> Fn(&'a mut RequestContext<V>) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Abort handling of the current request because the peer went away.
///
/// Panics with [`ClientAbort`]; the recovery boundary recognizes the marker,
/// logs a warning and skips both reporting and the response write.
pub fn abort_request() -> ! {
    panic_any(ClientAbort)
}

/// Per-request state threaded through the handler chain.
pub struct RequestContext<V> {
    request: Request<Body>,
    response: ResponseWriter,
    payload: V,
}

impl<V> RequestContext<V> {
    pub fn new(request: Request<Body>, payload: V) -> Self {
        Self {
            request,
            response: ResponseWriter::new(),
            payload,
        }
    }

    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseWriter {
        &mut self.response
    }

    pub fn payload(&self) -> &V {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut V {
        &mut self.payload
    }

    /// Write the structured JSON error envelope with status 500.
    pub fn send_error(&mut self, code: &str, detail: &dyn std::error::Error) {
        #[derive(Serialize)]
        struct ErrorEnvelope<'a> {
            error: &'a str,
            detail: String,
        }

        let body = serde_json::to_vec(&ErrorEnvelope {
            error: code,
            detail: detail.to_string(),
        })
        .unwrap_or_else(|_| br#"{"error":"err_internal_error"}"#.to_vec());

        self.response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        self.response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.response.write(&body);
    }

    /// Consume the context, yielding the buffered response.
    pub fn into_response(self) -> Response {
        self.response.into_response()
    }
}

/// Buffered status, header and body writer handed to handlers.
///
/// Nothing reaches the wire until the context is converted into a response,
/// which is what lets the recovery boundary replace a half-built response
/// after a panic.
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    written: bool,
}

impl ResponseWriter {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            written: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
        self.written = true;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Append bytes to the buffered body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
        self.written = true;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether a status or body has been written so far.
    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}
