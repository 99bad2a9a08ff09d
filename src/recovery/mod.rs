//! Last-chance panic boundary for the handler chain.
//!
//! # Responsibilities
//! - Never let a panic raised in a wrapped handler propagate further
//! - Capture the panicking stack and normalize the payload into an error
//! - Downgrade client-disconnect panics to warnings; report everything else
//! - Answer genuine faults with a generic 500, honoring a JSON content-type
//!   the handler may already have set

pub mod fault;
pub mod stack;

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use futures_util::future::BoxFuture;
use sentry::{Hub, Scope};
use tracing::{error, warn};

use crate::context::{handler, HandlerFunc, MiddlewareFunc, RequestContext};
use crate::report;
use fault::{FaultKind, RecoveredFault};

/// Marker tag stamped on every recovery log entry.
pub const LOG_TAG: &str = "[panic-recovery]";

/// Upper bound on the blocking wait for report delivery.
const REPORT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Panic boundary wrapping a handler chain.
///
/// Holds the injected reporting hub; every recovered fault reports through
/// an isolated hub derived from it, so concurrent requests never share
/// mutable scope state. Cloning is cheap and clones share the hub.
#[derive(Clone)]
pub struct RecoveryMiddleware {
    hub: Arc<Hub>,
    enrich: Option<Arc<dyn Fn(&mut Scope) + Send + Sync>>,
}

impl RecoveryMiddleware {
    /// Create a recovery boundary reporting through the given hub.
    ///
    /// Installs the process-wide capturing panic hook on first use.
    pub fn new(hub: Arc<Hub>) -> Self {
        stack::install_hook();
        Self { hub, enrich: None }
    }

    /// Extension point: adjust the per-fault reporting scope before the
    /// event is captured (attach a user, tags, release info).
    pub fn with_scope_enrichment<F>(mut self, enrich: F) -> Self
    where
        F: Fn(&mut Scope) + Send + Sync + 'static,
    {
        self.enrich = Some(Arc::new(enrich));
        self
    }

    /// Wrap a handler; the returned handler never lets a panic escape.
    pub fn wrap<V>(&self, next: HandlerFunc<V>) -> HandlerFunc<V>
    where
        V: Send + 'static,
    {
        let boundary = self.clone();
        handler(move |ctx: &mut RequestContext<V>| {
            let boundary = boundary.clone();
            let next = next.clone();
            Box::pin(async move {
                let outcome = CatchFault { handler: next(ctx) }.await;
                if let Err(fault) = outcome {
                    boundary.handle_fault(ctx, fault).await;
                }
            })
        })
    }

    async fn handle_fault<V>(&self, ctx: &mut RequestContext<V>, fault: RecoveredFault) {
        let path = ctx.request().uri().path().to_string();
        let method = ctx.request().method().to_string();

        match fault.kind() {
            FaultKind::ClientAbort => {
                // The connection is gone; nothing to report, nothing to answer.
                warn!(
                    path = %path,
                    method = %method,
                    "{} client aborted request (panic recovered)",
                    LOG_TAG
                );
            }
            FaultKind::InternalFault => {
                error!(
                    error = %fault.error(),
                    stack = %fault.stack_trace(),
                    stack_frames = ?fault.stack_lines(),
                    path = %path,
                    method = %method,
                    "{} panic recovered",
                    LOG_TAG
                );
                let request = report::request_payload(ctx.request());
                self.report_fault(request, &fault).await;
                write_error_response(ctx, &fault);
            }
        }
    }

    async fn report_fault(&self, request: sentry::protocol::Request, fault: &RecoveredFault) {
        let hub = Arc::new(Hub::new_from_top(&self.hub));
        let enrich = self.enrich.clone();
        hub.configure_scope(move |scope| {
            scope.add_event_processor(move |mut event| {
                event.request = Some(request.clone());
                Some(event)
            });
            if let Some(enrich) = enrich {
                enrich(scope);
            }
        });
        hub.capture_event(report::panic_event(fault));
        report::flush(&hub, REPORT_FLUSH_TIMEOUT).await;
    }
}

/// Recovery boundary as a plain middleware stage.
pub fn recovery_middleware<V>(hub: Arc<Hub>) -> MiddlewareFunc<V>
where
    V: Send + 'static,
{
    let boundary = RecoveryMiddleware::new(hub);
    Box::new(move |next| boundary.wrap(next))
}

/// Generic 500, honoring a JSON content-type the handler already declared.
fn write_error_response<V>(ctx: &mut RequestContext<V>, fault: &RecoveredFault) {
    let json = ctx
        .response()
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/json"))
        .unwrap_or(false);

    if json {
        ctx.send_error("err_internal_error", fault.error());
    } else {
        let writer = ctx.response_mut();
        writer.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        writer.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        writer.write(b"Internal Server Error");
    }
}

/// Future that polls the wrapped handler inside a panic boundary.
///
/// The thread-local capture marker is armed for exactly the duration of
/// each poll, so the panic hook only snapshots stacks for panics unwinding
/// through this boundary.
struct CatchFault<'a> {
    handler: BoxFuture<'a, ()>,
}

impl Future for CatchFault<'_> {
    type Output = Result<(), RecoveredFault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = {
            let _armed = stack::arm();
            panic::catch_unwind(AssertUnwindSafe(|| this.handler.as_mut().poll(cx)))
        };
        match poll {
            Ok(Poll::Ready(())) => Poll::Ready(Ok(())),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(RecoveredFault::new(payload, stack::take_captured()))),
        }
    }
}
