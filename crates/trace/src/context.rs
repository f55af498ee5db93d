use std::collections::BTreeMap;

use pagetrace_core::ids::{SpanId, TraceId};
use pagetrace_core::status::SpanStatus;
use pagetrace_core::trace_header::TraceHeader;
use serde_json::Value;
use tracing::debug;

/// Initial values for a child span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanContext {
    pub op: String,
    pub description: Option<String>,
    pub status: Option<SpanStatus>,
    pub tags: BTreeMap<String, String>,
    pub data: BTreeMap<String, Value>,
    pub start_timestamp: Option<f64>,
}

impl SpanContext {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Initial (and reconcilable) values for a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionContext {
    pub name: String,
    pub op: String,
    pub description: Option<String>,
    pub status: Option<SpanStatus>,
    pub tags: BTreeMap<String, String>,
    pub data: BTreeMap<String, Value>,
    pub trace_id: Option<TraceId>,
    pub parent_span_id: Option<SpanId>,
    pub parent_sampled: Option<bool>,
    /// Forces the sampling decision, bypassing the sampler.
    pub sampled: Option<bool>,
    /// Trim the end timestamp to the latest finished child on finish.
    pub trim_end: bool,
    pub start_timestamp: Option<f64>,
}

impl TransactionContext {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            ..Self::default()
        }
    }

    /// Continues an incoming trace when `header` parses; a malformed or
    /// missing header leaves the context on a fresh trace.
    pub fn continue_from_header(
        name: impl Into<String>,
        op: impl Into<String>,
        header: Option<&str>,
    ) -> Self {
        let ctx = Self::new(name, op);
        match header.map(|raw| (raw, TraceHeader::parse(raw))) {
            Some((_, Some(parsed))) => ctx.with_trace_header(&parsed),
            Some((raw, None)) => {
                debug!(header = %raw, "ignoring malformed trace header");
                ctx
            }
            None => ctx,
        }
    }

    pub fn with_trace_header(mut self, header: &TraceHeader) -> Self {
        self.trace_id = Some(header.trace_id.clone());
        self.parent_span_id = Some(header.parent_span_id.clone());
        self.parent_sampled = header.parent_sampled;
        self
    }

    pub fn metadata(&self) -> TransactionMetadata {
        TransactionMetadata {
            trace_id: self.trace_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
            parent_sampled: self.parent_sampled,
        }
    }
}

/// Incoming trace context a transaction was started from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub trace_id: Option<TraceId>,
    pub parent_span_id: Option<SpanId>,
    pub parent_sampled: Option<bool>,
}

/// What a sampler gets to look at when deciding.
#[derive(Debug, Clone, Copy)]
pub struct SamplingContext<'a> {
    pub transaction_context: &'a TransactionContext,
    pub parent_sampled: Option<bool>,
}

impl<'a> SamplingContext<'a> {
    pub fn new(transaction_context: &'a TransactionContext) -> Self {
        Self {
            transaction_context,
            parent_sampled: transaction_context.parent_sampled,
        }
    }
}
