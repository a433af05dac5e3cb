//! Span helpers following OpenTelemetry semantic conventions

use tracing::{span, Level, Span};

/// Server-side handling of one inbound request
#[inline]
pub fn request_span(protocol: &'static str, route: &str) -> Span {
    span!(
        Level::INFO,
        "metrics.request",
        rpc.system = protocol,
        http.route = %route,
        otel.kind = "server"
    )
}

/// One delivery attempt by a publisher worker
#[inline]
pub fn publish_span(worker: usize, transport: &'static str, batch: usize) -> Span {
    span!(
        Level::INFO,
        "metrics.publish",
        worker = worker,
        transport = transport,
        batch = batch,
        otel.kind = "client"
    )
}

/// A storage call
#[inline]
pub fn storage_span(backend: &'static str, operation: &'static str) -> Span {
    span!(
        Level::DEBUG,
        "metrics.storage",
        db.system = backend,
        db.operation = operation,
        otel.kind = "internal"
    )
}
