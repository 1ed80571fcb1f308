//! Outbound trace propagation.
//!
//! Calls to downstream services carry a W3C `traceparent` (plus `tracestate`
//! when the span has one) and the `x-request-id` of the inbound request, so a
//! slow scoring call can be followed across process boundaries.

use crate::middleware::tracing::{current_request_id, REQUEST_ID_HEADER};
use opentelemetry::trace::TraceContextExt;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Headers describing the current span and request scope. Empty outside both.
pub fn propagation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();

    let context = Span::current().context();
    let span_ref = context.span();
    let span_context = span_ref.span_context();
    if span_context.is_valid() {
        let traceparent = format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        );
        if let Ok(value) = HeaderValue::from_str(&traceparent) {
            headers.insert(TRACEPARENT_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&span_context.trace_state().header()) {
            if !value.is_empty() {
                headers.insert(TRACESTATE_HEADER, value);
            }
        }
    }

    if let Some(value) = current_request_id().and_then(|id| HeaderValue::from_str(&id).ok()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    headers
}

/// `reqwest::Client` requests pre-loaded with [`propagation_headers`].
pub trait TracedClientExt {
    fn traced_post(&self, url: &str) -> reqwest::RequestBuilder;
}

impl TracedClientExt for reqwest::Client {
    fn traced_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.post(url).headers(propagation_headers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_headers_outside_span_and_request() {
        assert!(propagation_headers().is_empty());
    }

    #[test]
    fn traced_post_targets_url() {
        let request = reqwest::Client::new()
            .traced_post("http://scoring.internal/score")
            .build()
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/score");
    }
}
