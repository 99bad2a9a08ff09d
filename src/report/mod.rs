//! Conversion of recovered faults into Sentry events.
//!
//! Event shape follows the SDK's panic integration: exception type
//! `panic`, mechanism `panic`, unhandled, fatal level, with the captured
//! stacktrace attached in protocol order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request};
use sentry::protocol::{Event, Exception, Frame, Mechanism, Stacktrace};
use sentry::{Hub, Level};

use crate::recovery::fault::RecoveredFault;
use crate::recovery::stack::StackFrame;

/// Build the event submitted for one recovered panic.
pub fn panic_event(fault: &RecoveredFault) -> Event<'static> {
    let exception = Exception {
        ty: "panic".into(),
        value: Some(fault.error().to_string()),
        stacktrace: stacktrace(fault.stack()),
        mechanism: Some(Mechanism {
            ty: "panic".into(),
            handled: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    Event {
        exception: vec![exception].into(),
        level: Level::Fatal,
        ..Default::default()
    }
}

/// Captured frames in protocol order (oldest call first).
fn stacktrace(stack: &[StackFrame]) -> Option<Stacktrace> {
    if stack.is_empty() {
        return None;
    }
    let mut frames: Vec<Frame> = stack
        .iter()
        .map(|frame| Frame {
            function: Some(frame.function.clone()),
            filename: Some(frame.file.clone()),
            lineno: Some(u64::from(frame.line)),
            ..Default::default()
        })
        .collect();
    frames.reverse();
    Some(Stacktrace {
        frames,
        ..Default::default()
    })
}

/// Best-effort protocol form of the inbound request.
///
/// The middleware usually sees an origin-form URI, so the authority falls
/// back to the `Host` header and the scheme to plain http.
pub fn request_payload(request: &Request<Body>) -> sentry::protocol::Request {
    let uri = request.uri();
    let host = uri.authority().map(|authority| authority.to_string()).or_else(|| {
        request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    let url = host.and_then(|host| {
        let scheme = uri.scheme_str().unwrap_or("http");
        format!("{}://{}{}", scheme, host, uri.path()).parse().ok()
    });

    let mut headers = BTreeMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.to_string(), value.to_string());
        }
    }

    sentry::protocol::Request {
        url,
        method: Some(request.method().to_string()),
        query_string: uri.query().map(str::to_string),
        headers,
        ..Default::default()
    }
}

/// Block for delivery of buffered reports, bounded by `timeout`.
///
/// The flush runs on the blocking pool; a timeout simply loses the report.
pub async fn flush(hub: &Arc<Hub>, timeout: Duration) {
    if let Some(client) = hub.client() {
        let delivered = tokio::task::spawn_blocking(move || client.flush(Some(timeout)))
            .await
            .unwrap_or(false);
        if !delivered {
            tracing::warn!(
                "{} report flush timed out, report may be lost",
                crate::recovery::LOG_TAG
            );
        }
    }
}
