//! Trace identity conventions.
//!
//! Trace identity is deterministic: a root execution's trace id is its
//! execution UUID with the hyphens stripped; child executions inherit via
//! the inbound W3C `traceparent`. Span kinds are inferred from the span
//! name prefix. The executor stamps these onto every execution span; the
//! worker's telemetry layer only has to export them.

/// Derive the deterministic OTel trace id for a root execution: the
/// execution UUID with hyphens stripped (32 hex chars).
pub fn trace_id_from_execution(execution_id: &str) -> Option<String> {
    let hex: String = execution_id.chars().filter(|c| *c != '-').collect();
    if hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex.to_ascii_lowercase())
    } else {
        None
    }
}

/// Parse a W3C `traceparent` header into `(trace_id, span_id)`.
pub fn parse_traceparent(header: &str) -> Option<(String, String)> {
    let mut parts = header.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    if trace_id.len() != 32 || span_id.len() != 16 {
        return None;
    }
    if !trace_id.chars().all(|c| c.is_ascii_hexdigit())
        || !span_id.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }
    Some((trace_id.to_owned(), span_id.to_owned()))
}

/// Span kind inferred from the span-name prefix.
pub fn span_kind_for(span_name: &str) -> &'static str {
    if span_name.starts_with("workflow.") {
        "SERVER"
    } else if span_name.starts_with("llm.") {
        "CLIENT"
    } else if span_name.starts_with("agent.")
        || span_name.starts_with("tool.")
        || span_name.starts_with("step.")
    {
        "INTERNAL"
    } else {
        "INTERNAL"
    }
}
