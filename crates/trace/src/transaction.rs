use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pagetrace_core::ids::{SpanId, TraceId};
use pagetrace_core::model::{SpanRecord, TransactionEvent};
use pagetrace_core::status::SpanStatus;
use pagetrace_core::trace_header::format_trace_header;
use serde_json::Value;
use tracing::debug;

use crate::clock::Clock;
use crate::context::{SpanContext, TransactionContext, TransactionMetadata};
use crate::idle::IdleState;
use crate::sampler::{Sampler, init_sampling};
use crate::sink::TransactionSink;
use crate::span::Span;

pub const MAX_DURATION_EXCEEDED_TAG: &str = "maxTransactionDurationExceeded";
pub const HEARTBEAT_TAG: &str = "heartbeat";
pub const HTTP_STATUS_TAG: &str = "http.status_code";

/// What drove a transaction into its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishCause {
    Caller,
    IdleTimeout,
    FinalTimeout,
    HeartbeatFailed,
}

/// Everything a new transaction borrows from its tracer.
pub(crate) struct TransactionSetup<'a> {
    pub(crate) sampler: Option<&'a Sampler>,
    pub(crate) sink: Arc<dyn TransactionSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) max_spans: usize,
}

pub(crate) struct TransactionInner {
    state: Mutex<TransactionState>,
    sink: Arc<dyn TransactionSink>,
    pub(crate) clock: Arc<dyn Clock>,
    trace_id: TraceId,
    span_id: SpanId,
    sampled: bool,
    max_spans: usize,
}

impl TransactionInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().expect("transaction state poisoned")
    }
}

pub(crate) struct TransactionState {
    pub(crate) name: String,
    pub(crate) root: SpanRecord,
    metadata: TransactionMetadata,
    pub(crate) children: Vec<SpanRecord>,
    index: HashMap<SpanId, usize>,
    trim_end: bool,
    pub(crate) max_duration: Option<Duration>,
    pub(crate) finished: bool,
    pub(crate) idle: Option<IdleState>,
}

impl TransactionState {
    pub(crate) fn latest_child_end(&self) -> Option<f64> {
        self.children
            .iter()
            .filter_map(|c| c.end_timestamp)
            .reduce(f64::max)
    }

    fn child_mut(&mut self, span_id: &SpanId) -> Option<&mut SpanRecord> {
        let pos = *self.index.get(span_id)?;
        self.children.get_mut(pos)
    }

    fn reindex(&mut self) {
        self.index = self
            .children
            .iter()
            .enumerate()
            .map(|(pos, c)| (c.span_id.clone(), pos))
            .collect();
    }
}

/// Root span of one unit of work. Cloning yields another handle to the same
/// transaction.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(
        ctx: TransactionContext,
        setup: TransactionSetup<'_>,
        max_duration: Option<Duration>,
        idle: Option<IdleState>,
    ) -> Self {
        let sampled = init_sampling(setup.sampler, &ctx);
        let trace_id = ctx.trace_id.clone().unwrap_or_else(TraceId::generate);
        let span_id = SpanId::generate();
        let start = ctx.start_timestamp.unwrap_or_else(|| setup.clock.now());
        let metadata = ctx.metadata();

        let mut root = SpanRecord::new(trace_id.clone(), span_id.clone(), ctx.op, start);
        root.parent_span_id = ctx.parent_span_id;
        root.description = ctx.description;
        root.status = ctx.status;
        root.tags = ctx.tags;
        root.data = ctx.data;

        debug!(
            name = %ctx.name,
            trace_id = %trace_id,
            sampled,
            "starting transaction"
        );

        Self {
            inner: Arc::new(TransactionInner {
                state: Mutex::new(TransactionState {
                    name: ctx.name,
                    root,
                    metadata,
                    children: Vec::new(),
                    index: HashMap::new(),
                    trim_end: ctx.trim_end,
                    max_duration,
                    finished: false,
                    idle,
                }),
                sink: setup.sink,
                clock: setup.clock,
                trace_id,
                span_id,
                sampled,
                max_spans: setup.max_spans,
            }),
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.inner.trace_id
    }

    pub fn span_id(&self) -> &SpanId {
        &self.inner.span_id
    }

    pub fn sampled(&self) -> bool {
        self.inner.sampled
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn op(&self) -> String {
        self.inner.lock().root.op.clone()
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.inner.lock().root.parent_span_id.clone()
    }

    pub fn metadata(&self) -> TransactionMetadata {
        self.inner.lock().metadata.clone()
    }

    pub fn start_timestamp(&self) -> f64 {
        self.inner.lock().root.start_timestamp
    }

    pub fn end_timestamp(&self) -> Option<f64> {
        self.inner.lock().root.end_timestamp
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn status(&self) -> Option<SpanStatus> {
        self.inner.lock().root.status
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.inner.lock().root.tags.clone()
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        self.inner.lock().root.tags.get(key).cloned()
    }

    pub fn data(&self) -> BTreeMap<String, Value> {
        self.inner.lock().root.data.clone()
    }

    /// Snapshot of the recorded descendant spans.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.inner.lock().children.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update_open(|state| state.name = name);
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.update_open(|state| state.root.status = Some(status));
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.update_open(|state| {
            state.root.tags.insert(key, value);
        });
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.update_open(|state| {
            state.root.data.insert(key, value);
        });
    }

    pub fn set_http_status(&self, code: u16) {
        self.update_open(|state| {
            state
                .root
                .tags
                .insert(HTTP_STATUS_TAG.to_string(), code.to_string());
            state.root.status = Some(SpanStatus::from_http_code(code));
        });
    }

    /// Value for an outgoing `sentry-trace` header.
    pub fn to_trace_header(&self) -> String {
        format_trace_header(self.trace_id(), self.span_id(), Some(self.sampled()))
    }

    /// Captures the reconcilable fields; identity and sampling are carried
    /// along but ignored by [`Transaction::update_with_context`].
    pub fn to_context(&self) -> TransactionContext {
        let state = self.inner.lock();
        TransactionContext {
            name: state.name.clone(),
            op: state.root.op.clone(),
            description: state.root.description.clone(),
            status: state.root.status,
            tags: state.root.tags.clone(),
            data: state.root.data.clone(),
            trace_id: Some(self.inner.trace_id.clone()),
            parent_span_id: state.root.parent_span_id.clone(),
            parent_sampled: state.metadata.parent_sampled,
            sampled: Some(self.inner.sampled),
            trim_end: state.trim_end,
            start_timestamp: Some(state.root.start_timestamp),
        }
    }

    /// Overwrites name, op, description, status, tags and data.
    pub fn update_with_context(&self, ctx: TransactionContext) {
        self.update_open(|state| {
            state.name = ctx.name;
            state.root.op = ctx.op;
            state.root.description = ctx.description;
            state.root.status = ctx.status;
            state.root.tags = ctx.tags;
            state.root.data = ctx.data;
            state.trim_end = ctx.trim_end;
        });
    }

    pub fn start_child(&self, ctx: SpanContext) -> Span {
        self.start_span(self.span_id(), ctx)
    }

    pub fn finish(&self) {
        self.finish_with(None, FinishCause::Caller);
    }

    pub fn finish_at(&self, end_timestamp: f64) {
        self.finish_with(Some(end_timestamp), FinishCause::Caller);
    }

    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn update_open(&self, f: impl FnOnce(&mut TransactionState)) {
        let mut state = self.inner.lock();
        if state.finished {
            debug!("ignoring update on finished transaction");
            return;
        }
        f(&mut state);
    }

    pub(crate) fn start_span(&self, parent: &SpanId, ctx: SpanContext) -> Span {
        let span_id = SpanId::generate();
        let start = ctx.start_timestamp.unwrap_or_else(|| self.inner.clock.now());
        let mut record = SpanRecord::new(self.trace_id().clone(), span_id.clone(), ctx.op, start);
        record.parent_span_id = Some(parent.clone());
        record.description = ctx.description;
        record.status = ctx.status;
        record.tags = ctx.tags;
        record.data = ctx.data;

        let mut state = self.inner.lock();
        if state.finished {
            debug!(span_id = %span_id, "transaction already finished; span not recorded");
            return Span::detached(self.clone(), record);
        }
        if state.children.len() >= self.inner.max_spans {
            debug!(
                max_spans = self.inner.max_spans,
                "span limit reached; span not recorded"
            );
            return Span::detached(self.clone(), record);
        }

        let pos = state.children.len();
        state.index.insert(span_id.clone(), pos);
        state.children.push(record.clone());
        if let Some(idle) = state.idle.as_mut() {
            idle.push_activity(span_id);
        }
        drop(state);

        Span::recorded(self.clone(), record)
    }

    pub(crate) fn update_span(&self, span_id: &SpanId, f: impl FnOnce(&mut SpanRecord)) {
        let mut state = self.inner.lock();
        if state.finished {
            return;
        }
        if let Some(record) = state.child_mut(span_id)
            && record.end_timestamp.is_none()
        {
            f(record);
        }
    }

    pub(crate) fn span_record(&self, span_id: &SpanId) -> Option<SpanRecord> {
        let mut state = self.inner.lock();
        state.child_mut(span_id).map(|r| r.clone())
    }

    /// Returns the end timestamp written, or `None` if the span was already closed.
    pub(crate) fn finish_span(&self, span_id: &SpanId, end: Option<f64>) -> Option<f64> {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock();
        if state.finished {
            return None;
        }
        let record = state.child_mut(span_id)?;
        if record.end_timestamp.is_some() {
            return None;
        }
        let end = end.unwrap_or(now).max(record.start_timestamp);
        record.end_timestamp = Some(end);

        let notice = self.pop_activity(&mut state, span_id);
        drop(state);

        if let Some(notice) = notice {
            notice.notify();
        }
        Some(end)
    }

    pub(crate) fn finish_with(&self, end: Option<f64>, cause: FinishCause) {
        let event = {
            let mut state = self.inner.lock();
            self.finish_locked(&mut state, end, cause)
        };
        self.deliver(event);
    }

    pub(crate) fn deliver(&self, event: Option<TransactionEvent>) {
        if let Some(event) = event {
            self.inner.sink.capture(event);
        }
    }

    /// The single terminal transition. Every finish trigger ends up here
    /// while holding the state lock; a second call is a no-op.
    pub(crate) fn finish_locked(
        &self,
        state: &mut TransactionState,
        end: Option<f64>,
        cause: FinishCause,
    ) -> Option<TransactionEvent> {
        if state.finished {
            return None;
        }
        state.finished = true;
        if let Some(idle) = state.idle.as_mut() {
            idle.shutdown();
        }

        let start = state.root.start_timestamp;
        let mut end = end.unwrap_or_else(|| self.inner.clock.now());
        let mut deadline_hit = false;

        match cause {
            FinishCause::FinalTimeout => {
                state.root.status = Some(SpanStatus::DeadlineExceeded);
                state
                    .root
                    .tags
                    .insert(MAX_DURATION_EXCEEDED_TAG.to_string(), "true".to_string());
                deadline_hit = true;
            }
            FinishCause::HeartbeatFailed => {
                state.root.status = Some(SpanStatus::DeadlineExceeded);
                state
                    .root
                    .tags
                    .insert(HEARTBEAT_TAG.to_string(), "failed".to_string());
                deadline_hit = true;
            }
            FinishCause::Caller | FinishCause::IdleTimeout => {}
        }

        if let Some(max) = state.max_duration {
            let max = max.as_secs_f64();
            let elapsed = end - start;
            if elapsed > max || elapsed < 0.0 {
                state.root.status = Some(SpanStatus::DeadlineExceeded);
                state
                    .root
                    .tags
                    .insert(MAX_DURATION_EXCEEDED_TAG.to_string(), "true".to_string());
                end = if elapsed < 0.0 { start } else { start + max };
                deadline_hit = true;
            }
        }

        end = end.max(start);

        // Open children close at the untrimmed end so trimming sees them.
        for child in &mut state.children {
            if child.end_timestamp.is_none() {
                child.end_timestamp = Some(end.max(child.start_timestamp));
                child.status = Some(SpanStatus::Cancelled);
            }
        }
        state.children.retain(|c| c.start_timestamp <= end);
        state.reindex();

        if !deadline_hit
            && state.trim_end
            && let Some(latest) = state.latest_child_end()
        {
            end = latest.max(start);
        }
        state.root.end_timestamp = Some(end);

        debug!(
            name = %state.name,
            cause = ?cause,
            spans = state.children.len(),
            duration_ms = (end - start) * 1000.0,
            "transaction finished"
        );

        if !self.inner.sampled {
            debug!(name = %state.name, "dropping unsampled transaction");
            return None;
        }
        Some(TransactionEvent::from_root(
            state.name.clone(),
            &state.root,
            state.children.clone(),
        ))
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("trace_id", &self.inner.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("sampled", &self.inner.sampled)
            .finish_non_exhaustive()
    }
}
