use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pagetrace_core::ids::{SpanId, TraceId};
use pagetrace_core::model::{SpanRecord, TransactionEvent};
use pagetrace_core::status::SpanStatus;
use pagetrace_core::time::unix_seconds;
use pagetrace_trace::TransactionSink;
use pagetrace_transport::{HttpResponse, HttpSender, OutboundRequest, SendError};

/// Keeps every captured transaction for later assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TransactionEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionSink for RecordingSink {
    fn capture(&self, event: TransactionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Answers requests from a script, then with 200 once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<Result<HttpResponse, String>>>,
    requests: Mutex<Vec<OutboundRequest>>,
    delay: Option<Duration>,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request waits this long (in tokio time) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(self, response: HttpResponse) -> Self {
        self.script.lock().unwrap().push_back(Ok(response));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpSender for ScriptedSender {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, SendError> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(SendError::Network(message)),
            None => Ok(HttpResponse::new(200)),
        }
    }
}

pub fn rate_limited(retry_after: &str) -> HttpResponse {
    HttpResponse::new(429).with_header("Retry-After", retry_after)
}

/// A finished two-span page load on a fixed clock.
pub fn sample_event(name: &str) -> TransactionEvent {
    let base = unix_seconds(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
    let trace_id = TraceId::parse("126de09502ae4e0fb26c6967190756a4").unwrap();

    let mut root = SpanRecord::new(trace_id.clone(), SpanId::generate(), "pageload", base);
    root.end_timestamp = Some(base + 1.8);
    root.status = Some(SpanStatus::Ok);

    let mut fetch = SpanRecord::new(trace_id.clone(), SpanId::generate(), "http.client", base + 0.2);
    fetch.parent_span_id = Some(root.span_id.clone());
    fetch.description = Some("GET /api/orders".to_string());
    fetch.end_timestamp = Some(base + 0.9);
    fetch.status = Some(SpanStatus::Ok);

    let mut render = SpanRecord::new(trace_id, SpanId::generate(), "ui.render", base + 0.9);
    render.parent_span_id = Some(root.span_id.clone());
    render.end_timestamp = Some(base + 1.8);

    TransactionEvent::from_root(name, &root, vec![fetch, render])
}
