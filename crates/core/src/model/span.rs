use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{SpanId, TraceId};
use crate::status::SpanStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRecord {
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
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
    pub start_timestamp: f64,
    #[serde(rename = "timestamp", default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<f64>,
}

impl SpanRecord {
    pub fn new(trace_id: TraceId, span_id: SpanId, op: impl Into<String>, start: f64) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            op: op.into(),
            description: None,
            status: None,
            tags: BTreeMap::new(),
            data: BTreeMap::new(),
            start_timestamp: start,
            end_timestamp: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_timestamp.is_some()
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.end_timestamp
            .map(|end| ((end - self.start_timestamp) * 1000.0).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_span_has_no_duration() {
        let span = SpanRecord::new(TraceId::generate(), SpanId::generate(), "db", 10.0);
        assert!(!span.is_finished());
        assert_eq!(span.duration_ms(), None);
    }

    #[test]
    fn serializes_end_as_timestamp() {
        let mut span = SpanRecord::new(
            TraceId::parse("126de09502ae4e0fb26c6967190756a4").unwrap(),
            SpanId::parse("b6e54397b12a2a0f").unwrap(),
            "http",
            10.0,
        );
        span.end_timestamp = Some(10.5);
        span.tags.insert("route".into(), "/orders".into());

        let json = serde_json::to_value(&span).unwrap();
        assert_eq!(json["timestamp"], 10.5);
        assert_eq!(json["tags"]["route"], "/orders");
        assert!(json.get("parent_span_id").is_none());
        assert_eq!(span.duration_ms(), Some(500.0));
    }
}
