//! W3C Trace Context propagation for outbound HTTP calls to collaborators.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::TraceContextExt;
use reqwest::header::HeaderMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    /// Request ID of the inbound HTTP request being served on this task.
    pub static REQUEST_ID: String;
}

/// The inbound request ID, when called inside a request handled by
/// `request_id_middleware`.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// Build the `traceparent` value for the current span, if it carries a valid
/// OpenTelemetry context.
fn current_traceparent() -> Option<(String, String)> {
    let context = Span::current().context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if !span_context.is_valid() {
        return None;
    }

    // version-trace_id-span_id-trace_flags
    let traceparent = format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    );
    Some((traceparent, span_context.trace_state().header()))
}

/// Inject trace context and an optional request ID into outbound headers.
pub fn inject_trace_headers(headers: &mut HeaderMap, request_id: Option<&str>) {
    if let Some((traceparent, tracestate)) = current_traceparent() {
        if let Ok(value) = traceparent.parse() {
            headers.insert(TRACEPARENT_HEADER, value);
        }
        if !tracestate.is_empty() {
            if let Ok(value) = tracestate.parse() {
                headers.insert(TRACESTATE_HEADER, value);
            }
        }
    }

    if let Some(id) = request_id {
        if let Ok(value) = id.parse() {
            headers.insert(REQUEST_ID_HEADER, value);
        }
    }
}
