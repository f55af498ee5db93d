use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::ids::{SpanId, TraceId};

/// Header (and `<meta>` name) that carries incoming trace context.
pub const TRACE_HEADER_NAME: &str = "sentry-trace";

/// Parsed `traceId-parentSpanId[-sampled]` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub trace_id: TraceId,
    pub parent_span_id: SpanId,
    pub parent_sampled: Option<bool>,
}

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[ \t]*([0-9a-f]{32})-([0-9a-f]{16})(?:-([01]))?[ \t]*$")
            .expect("trace header pattern is valid")
    })
}

impl TraceHeader {
    /// Returns `None` for anything malformed; callers start a fresh trace instead.
    pub fn parse(input: &str) -> Option<Self> {
        let caps = header_regex().captures(input)?;
        let trace_id = TraceId::parse(caps.get(1)?.as_str()).ok()?;
        let parent_span_id = SpanId::parse(caps.get(2)?.as_str()).ok()?;
        let parent_sampled = caps.get(3).map(|m| m.as_str() == "1");
        Some(Self {
            trace_id,
            parent_span_id,
            parent_sampled,
        })
    }
}

impl fmt::Display for TraceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_trace_header(
            &self.trace_id,
            &self.parent_span_id,
            self.parent_sampled,
        ))
    }
}

pub fn format_trace_header(trace_id: &TraceId, span_id: &SpanId, sampled: Option<bool>) -> String {
    match sampled {
        Some(true) => format!("{trace_id}-{span_id}-1"),
        Some(false) => format!("{trace_id}-{span_id}-0"),
        None => format!("{trace_id}-{span_id}"),
    }
}
