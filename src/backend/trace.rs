//! Span bookkeeping for backend preparation.
//!
//! Stage spans are plain `tracing` spans held by the connector and ended
//! explicitly (preparation stages do not nest lexically). Attributes with
//! dynamic keys are recorded as events inside the owning span.

use std::fmt::Display;

use tracing::{debug, trace, Span};

/// Emit a stage marker, mirroring the connector's progress
pub fn stage(name: &str) {
    trace!(stage = name);
}

/// End a span successfully
pub fn span_end(span: &mut Option<Span>) {
    span.take();
}

/// End a span with an error status
pub fn span_end_err(span: &mut Option<Span>) {
    if let Some(span) = span.take() {
        span.record("otel.status_code", "ERROR");
    }
}

/// Attach a key/value attribute to a span
pub fn span_attr(span: &Option<Span>, key: &str, value: impl Display) {
    if let Some(span) = span {
        span.in_scope(|| debug!(attribute = key, value = %value));
    }
}
