//! Behavior of the recovery boundary around a handler chain.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use futures_util::future::BoxFuture;
use sentry::test::TestTransport;
use sentry::{Client, ClientOptions, Hub};
use sentry_recovery::{
    recovery_middleware, ClientAbort, MiddlewareFunc, RecoveryMiddleware, RequestContext, LOG_TAG,
    MAX_STACK_FRAMES,
};

fn test_hub() -> (Arc<Hub>, Arc<TestTransport>) {
    let transport = TestTransport::new();
    let options = ClientOptions {
        dsn: Some("https://public@sentry.invalid/1".parse().unwrap()),
        transport: Some(Arc::new(transport.clone())),
        ..Default::default()
    };
    let client = Client::from_config(options);
    let hub = Arc::new(Hub::new(Some(Arc::new(client)), Arc::new(Default::default())));
    (hub, transport)
}

fn request(method: &str, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, "api.test")
        .body(Body::empty())
        .unwrap()
}

fn ok_handler(ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        ctx.response_mut().write(b"all good");
    })
}

fn boom_handler(_ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
    Box::pin(async move { panic!("boom") })
}

fn json_boom_handler(ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        ctx.response_mut().headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        panic!("boom")
    })
}

fn numeric_boom_handler(_ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
    Box::pin(async move { std::panic::panic_any(7_i32) })
}

fn abort_handler(_ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
    Box::pin(async move { sentry_recovery::abort_request() })
}

#[derive(Debug, thiserror::Error)]
#[error("response write failed")]
struct WriteFailed(#[source] ClientAbort);

fn wrapped_abort_handler(_ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let cause: Box<dyn std::error::Error + Send + Sync> = Box::new(WriteFailed(ClientAbort));
        std::panic::panic_any(cause)
    })
}

/// Captures formatted log output for assertions.
#[derive(Clone, Default)]
struct LogSink(Arc<Mutex<Vec<u8>>>);

impl LogSink {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes log-capturing sections: `with_default` mutates process-global
/// tracing state, so concurrent capturers would otherwise clobber each other.
static LOG_SERIAL: Mutex<()> = Mutex::new(());

fn run_logged<F: FnOnce()>(sink: &LogSink, f: F) {
    let _serial = LOG_SERIAL.lock().unwrap_or_else(|poison| poison.into_inner());
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let sink = sink.clone();
            move || sink.clone()
        })
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
}

#[tokio::test]
async fn normal_path_is_pass_through() {
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub).wrap(Arc::new(ok_handler));

    let mut ctx = RequestContext::new(request("GET", "/healthy"), ());
    wrapped(&mut ctx).await;

    assert_eq!(ctx.response().status(), StatusCode::OK);
    assert_eq!(ctx.response().body(), b"all good");
    assert!(transport.fetch_and_clear_events().is_empty());
}

#[tokio::test]
async fn internal_fault_writes_plain_500_and_reports() {
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub).wrap(Arc::new(boom_handler));

    let mut ctx = RequestContext::new(request("GET", "/kaboom"), ());
    tokio::time::timeout(Duration::from_secs(5), wrapped(&mut ctx))
        .await
        .expect("recovery must not hang past the flush bound");

    assert_eq!(ctx.response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(ctx.response().body(), b"Internal Server Error");
    assert_eq!(
        ctx.response().headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );

    let events = transport.fetch_and_clear_events();
    assert_eq!(events.len(), 1);

    let exception = &events[0].exception.values[0];
    assert_eq!(exception.ty, "panic");
    assert_eq!(exception.value.as_deref(), Some("boom"));
    if let Some(stacktrace) = &exception.stacktrace {
        assert!(stacktrace.frames.len() <= MAX_STACK_FRAMES);
    }

    let attached = events[0].request.as_ref().expect("request attached to event");
    assert_eq!(attached.method.as_deref(), Some("GET"));
    assert_eq!(attached.url.as_ref().unwrap().path(), "/kaboom");
}

#[test]
fn internal_fault_logs_exactly_one_error_entry() {
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub).wrap(Arc::new(boom_handler));

    let mut ctx = RequestContext::new(request("POST", "/kaboom"), ());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let sink = LogSink::default();
    run_logged(&sink, || runtime.block_on(wrapped(&mut ctx)));

    let logs = sink.contents();
    assert_eq!(logs.matches("ERROR").count(), 1);
    assert!(logs.contains(LOG_TAG));
    assert!(logs.contains("panic recovered"));
    assert!(logs.contains("/kaboom"));
    assert!(logs.contains("POST"));
    assert_eq!(transport.fetch_and_clear_events().len(), 1);
}

#[test]
fn client_abort_logs_one_warning_and_nothing_else() {
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub).wrap(Arc::new(abort_handler));

    let mut ctx = RequestContext::new(request("DELETE", "/gone"), ());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let sink = LogSink::default();
    run_logged(&sink, || runtime.block_on(wrapped(&mut ctx)));

    let logs = sink.contents();
    assert_eq!(logs.matches("WARN").count(), 1);
    assert!(logs.contains("client aborted request"));
    assert!(logs.contains("/gone"));
    assert!(logs.contains("DELETE"));

    // No report, no response write.
    assert!(transport.fetch_and_clear_events().is_empty());
    assert!(!ctx.response().is_written());
    assert!(ctx.response().body().is_empty());
}

#[tokio::test]
async fn abort_buried_in_cause_chain_is_not_reported() {
    let _serial = LOG_SERIAL.lock().unwrap_or_else(|poison| poison.into_inner());
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub).wrap(Arc::new(wrapped_abort_handler));

    let mut ctx = RequestContext::new(request("GET", "/stream"), ());
    wrapped(&mut ctx).await;

    assert!(transport.fetch_and_clear_events().is_empty());
    assert!(!ctx.response().is_written());
}

#[tokio::test]
async fn declared_json_content_type_gets_structured_error() {
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub).wrap(Arc::new(json_boom_handler));

    let mut ctx = RequestContext::new(request("GET", "/api/orders"), ());
    wrapped(&mut ctx).await;

    assert_eq!(ctx.response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_slice(ctx.response().body()).unwrap();
    assert_eq!(body["error"], "err_internal_error");
    assert_eq!(body["detail"], "boom");
    assert_eq!(transport.fetch_and_clear_events().len(), 1);
}

#[tokio::test]
async fn non_error_payload_is_normalized_not_misclassified() {
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub).wrap(Arc::new(numeric_boom_handler));

    let mut ctx = RequestContext::new(request("GET", "/numeric"), ());
    wrapped(&mut ctx).await;

    // Still treated as a genuine fault: reported and answered with a 500.
    assert_eq!(ctx.response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    let events = transport.fetch_and_clear_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].exception.values[0].value.as_deref(), Some("7"));
}

#[tokio::test]
async fn middleware_factory_composes_like_any_stage() {
    let (hub, transport) = test_hub();
    let stage: MiddlewareFunc<()> = recovery_middleware(hub);
    let wrapped = stage(Arc::new(boom_handler));

    let mut ctx = RequestContext::new(request("GET", "/kaboom"), ());
    wrapped(&mut ctx).await;

    assert_eq!(ctx.response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(transport.fetch_and_clear_events().len(), 1);
}

#[tokio::test]
async fn scope_enrichment_hook_applies_to_reports() {
    let (hub, transport) = test_hub();
    let wrapped = RecoveryMiddleware::new(hub)
        .with_scope_enrichment(|scope| scope.set_tag("deployment", "canary"))
        .wrap(Arc::new(boom_handler));

    let mut ctx = RequestContext::new(request("GET", "/kaboom"), ());
    wrapped(&mut ctx).await;

    let events = transport.fetch_and_clear_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tags.get("deployment").map(String::as_str), Some("canary"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_panics_keep_request_metadata_isolated() {
    let (hub, transport) = test_hub();
    let boundary = RecoveryMiddleware::new(hub);

    fn boom_alpha(_ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
        Box::pin(async move { panic!("boom-alpha") })
    }
    fn boom_beta(_ctx: &mut RequestContext<()>) -> BoxFuture<'_, ()> {
        Box::pin(async move { panic!("boom-beta") })
    }

    let wrapped_alpha = boundary.wrap(Arc::new(boom_alpha));
    let wrapped_beta = boundary.wrap(Arc::new(boom_beta));

    let task_alpha = tokio::spawn(async move {
        let mut ctx = RequestContext::new(request("GET", "/alpha"), ());
        wrapped_alpha(&mut ctx).await;
    });
    let task_beta = tokio::spawn(async move {
        let mut ctx = RequestContext::new(request("GET", "/beta"), ());
        wrapped_beta(&mut ctx).await;
    });
    task_alpha.await.unwrap();
    task_beta.await.unwrap();

    let events = transport.fetch_and_clear_events();
    assert_eq!(events.len(), 2);
    for event in events {
        let value = event.exception.values[0].value.clone().unwrap();
        let url = event.request.unwrap().url.unwrap();
        match value.as_str() {
            "boom-alpha" => assert_eq!(url.path(), "/alpha"),
            "boom-beta" => assert_eq!(url.path(), "/beta"),
            other => panic!("unexpected event value: {other}"),
        }
    }
}
