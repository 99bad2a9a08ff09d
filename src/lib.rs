//! Panic recovery middleware with Sentry reporting.
//!
//! Wraps a request handler chain and guarantees that no panic raised while
//! handling a request escapes the wrapped handler. A recovered panic is
//! normalized into an error, classified, logged with the captured stack,
//! and, unless the client simply went away, reported to Sentry and
//! answered with a generic 500.
//!
//! ```text
//!   request ──▶ recovery boundary ──▶ inner handler(s)
//!                     │
//!                     │ panic unwinds back into the boundary
//!                     ▼
//!       capture stack ─▶ normalize ─▶ classify
//!                                        │
//!                   ┌────────────────────┴──────────────────┐
//!                   ▼                                       ▼
//!             ClientAbort                             InternalFault
//!             warn log only                error log + Sentry report (flush ≤ 2s)
//!             no response                  500 response (text or JSON)
//! ```

// Handler-chain contract
pub mod context;

// Panic interception
pub mod recovery;

// Sentry event building
pub mod report;

// Axum bridge
pub mod server;

pub use context::{abort_request, handler, HandlerFunc, MiddlewareFunc, RequestContext, ResponseWriter};
pub use recovery::fault::{ClientAbort, FaultKind, PanicError, RecoveredFault};
pub use recovery::stack::{StackFrame, MAX_STACK_FRAMES};
pub use recovery::{recovery_middleware, RecoveryMiddleware, LOG_TAG};
