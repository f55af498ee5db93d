use pagetrace_core::ids::{SpanId, TraceId};
use pagetrace_core::model::SpanRecord;
use pagetrace_core::status::SpanStatus;
use pagetrace_core::trace_header::format_trace_header;
use serde_json::Value;

use crate::context::SpanContext;
use crate::transaction::{HTTP_STATUS_TAG, Transaction};

/// Handle to a descendant span. The record itself lives in the owning
/// transaction; a span that did not fit under the span limit, or was started
/// after the transaction finished, is detached and ignores every update.
#[derive(Debug, Clone)]
pub struct Span {
    transaction: Transaction,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    start_timestamp: f64,
    recorded: bool,
}

impl Span {
    pub(crate) fn recorded(transaction: Transaction, record: SpanRecord) -> Self {
        Self::from_record(transaction, record, true)
    }

    pub(crate) fn detached(transaction: Transaction, record: SpanRecord) -> Self {
        Self::from_record(transaction, record, false)
    }

    fn from_record(transaction: Transaction, record: SpanRecord, recorded: bool) -> Self {
        Self {
            transaction,
            span_id: record.span_id,
            parent_span_id: record.parent_span_id,
            start_timestamp: record.start_timestamp,
            recorded,
        }
    }

    pub fn span_id(&self) -> &SpanId {
        &self.span_id
    }

    pub fn trace_id(&self) -> &TraceId {
        self.transaction.trace_id()
    }

    pub fn parent_span_id(&self) -> Option<&SpanId> {
        self.parent_span_id.as_ref()
    }

    pub fn sampled(&self) -> bool {
        self.transaction.sampled()
    }

    pub fn start_timestamp(&self) -> f64 {
        self.start_timestamp
    }

    /// Whether the span is part of its transaction's span list.
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Current state of the span, or `None` for a detached span.
    pub fn record(&self) -> Option<SpanRecord> {
        if !self.recorded {
            return None;
        }
        self.transaction.span_record(&self.span_id)
    }

    pub fn end_timestamp(&self) -> Option<f64> {
        self.record().and_then(|r| r.end_timestamp)
    }

    pub fn is_finished(&self) -> bool {
        self.end_timestamp().is_some()
    }

    pub fn start_child(&self, ctx: SpanContext) -> Span {
        self.transaction.start_span(&self.span_id, ctx)
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.update(|r| r.status = Some(status));
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.update(|r| {
            r.tags.insert(key, value);
        });
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.update(|r| {
            r.data.insert(key, value);
        });
    }

    pub fn set_description(&self, description: impl Into<String>) {
        let description = description.into();
        self.update(|r| r.description = Some(description));
    }

    pub fn set_http_status(&self, code: u16) {
        self.update(|r| {
            r.tags.insert(HTTP_STATUS_TAG.to_string(), code.to_string());
            r.status = Some(SpanStatus::from_http_code(code));
        });
    }

    pub fn to_trace_header(&self) -> String {
        format_trace_header(self.trace_id(), &self.span_id, Some(self.sampled()))
    }

    pub fn finish(&self) {
        if self.recorded {
            self.transaction.finish_span(&self.span_id, None);
        }
    }

    /// An end before the start is clamped to the start.
    pub fn finish_at(&self, end_timestamp: f64) {
        if self.recorded {
            self.transaction
                .finish_span(&self.span_id, Some(end_timestamp));
        }
    }

    fn update(&self, f: impl FnOnce(&mut SpanRecord)) {
        if self.recorded {
            self.transaction.update_span(&self.span_id, f);
        }
    }
}
