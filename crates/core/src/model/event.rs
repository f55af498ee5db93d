use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{SpanId, TraceId};
use crate::model::span::SpanRecord;
use crate::status::SpanStatus;

/// A finished, sampled transaction and its span tree, as shipped to the collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub transaction: String,
    pub start_timestamp: f64,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub contexts: EventContexts,
    pub spans: Vec<SpanRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventContexts {
    pub trace: TraceContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl TransactionEvent {
    /// Builds the event from a finished root span; an open root is treated as zero-length.
    pub fn from_root(name: impl Into<String>, root: &SpanRecord, spans: Vec<SpanRecord>) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            kind: "transaction".to_string(),
            transaction: name.into(),
            start_timestamp: root.start_timestamp,
            timestamp: root.end_timestamp.unwrap_or(root.start_timestamp),
            tags: root.tags.clone(),
            contexts: EventContexts {
                trace: TraceContext {
                    trace_id: root.trace_id.clone(),
                    span_id: root.span_id.clone(),
                    parent_span_id: root.parent_span_id.clone(),
                    op: root.op.clone(),
                    description: root.description.clone(),
                    status: root.status,
                    data: root.data.clone(),
                },
            },
            spans,
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.contexts.trace.trace_id
    }

    pub fn status(&self) -> Option<SpanStatus> {
        self.contexts.trace.status
    }

    pub fn duration_ms(&self) -> f64 {
        ((self.timestamp - self.start_timestamp) * 1000.0).max(0.0)
    }
}
