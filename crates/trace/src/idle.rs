use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use pagetrace_core::config::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_TRANSACTION_DURATION,
};
use pagetrace_core::ids::SpanId;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::transaction::{FinishCause, Transaction, TransactionInner, TransactionState};

/// Unchanged heartbeats with open activity before the transaction is given up on.
pub const HEARTBEAT_MAX_UNCHANGED_BEATS: u32 = 3;

pub type ScheduleCallback = dyn Fn(Duration) + Send + Sync;

#[derive(Clone)]
pub struct IdleOptions {
    pub idle_timeout: Duration,
    /// Hard cap on the transaction's duration.
    pub final_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Called with the delay every time the idle timer is (re)scheduled.
    pub on_schedule_timeout: Option<Arc<ScheduleCallback>>,
}

impl Default for IdleOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            final_timeout: DEFAULT_MAX_TRANSACTION_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            on_schedule_timeout: None,
        }
    }
}

impl IdleOptions {
    /// Replaces zero durations with their defaults, warning once per
    /// adjustment. Returns the adjusted option names.
    pub fn normalize(&mut self) -> Vec<&'static str> {
        let mut adjusted = Vec::new();

        if self.idle_timeout.is_zero() {
            warn!("idle_timeout must be positive; using default");
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
            adjusted.push("idle_timeout");
        }
        if self.final_timeout.is_zero() {
            warn!("final_timeout must be positive; using default");
            self.final_timeout = DEFAULT_MAX_TRANSACTION_DURATION;
            adjusted.push("final_timeout");
        }
        if self.heartbeat_interval.is_zero() {
            warn!("heartbeat_interval must be positive; using default");
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
            adjusted.push("heartbeat_interval");
        }

        adjusted
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_final_timeout(mut self, timeout: Duration) -> Self {
        self.final_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn on_schedule_timeout<F>(mut self, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.on_schedule_timeout = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for IdleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleOptions")
            .field("idle_timeout", &self.idle_timeout)
            .field("final_timeout", &self.final_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("on_schedule_timeout", &self.on_schedule_timeout.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Idle(u64),
    Heartbeat,
    Final,
}

/// Deferred `on_schedule_timeout` call, run once the state lock is released.
pub(crate) struct ScheduleNotice {
    callback: Arc<ScheduleCallback>,
    delay: Duration,
}

impl ScheduleNotice {
    pub(crate) fn notify(self) {
        (self.callback)(self.delay);
    }
}

pub(crate) struct IdleState {
    options: IdleOptions,
    activities: BTreeSet<SpanId>,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
    heartbeat_timer: Option<JoinHandle<()>>,
    final_timer: Option<JoinHandle<()>>,
    last_beat: Option<BTreeSet<SpanId>>,
    unchanged_beats: u32,
}

impl IdleState {
    pub(crate) fn new(options: IdleOptions) -> Self {
        Self {
            options,
            activities: BTreeSet::new(),
            generation: 0,
            idle_timer: None,
            heartbeat_timer: None,
            final_timer: None,
            last_beat: None,
            unchanged_beats: 0,
        }
    }

    pub(crate) fn push_activity(&mut self, span_id: SpanId) {
        self.activities.insert(span_id);
        self.cancel_idle_timer();
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }

    /// Returns true when the heartbeat has failed.
    fn beat(&mut self) -> bool {
        if self.activities.is_empty() {
            self.last_beat = None;
            self.unchanged_beats = 0;
            return false;
        }
        if self.last_beat.as_ref() == Some(&self.activities) {
            self.unchanged_beats += 1;
        } else {
            self.last_beat = Some(self.activities.clone());
            self.unchanged_beats = 1;
        }
        debug!(
            activities = self.activities.len(),
            unchanged_beats = self.unchanged_beats,
            "heartbeat"
        );
        self.unchanged_beats >= HEARTBEAT_MAX_UNCHANGED_BEATS
    }

    pub(crate) fn shutdown(&mut self) {
        self.cancel_idle_timer();
        for timer in [self.heartbeat_timer.take(), self.final_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        self.activities.clear();
    }
}

fn spawn_timer(
    inner: Weak<TransactionInner>,
    kind: TimerKind,
    delay: Duration,
) -> Option<JoinHandle<()>> {
    let Ok(handle) = Handle::try_current() else {
        debug!(?kind, "no tokio runtime; timer not scheduled");
        return None;
    };
    let mut deadline = Instant::now() + delay;
    Some(handle.spawn(async move {
        loop {
            sleep_until(deadline).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if !(Transaction { inner }).on_timer(kind) {
                return;
            }
            deadline += delay;
        }
    }))
}

impl Transaction {
    pub(crate) fn start_idle_timers(&self) -> Option<ScheduleNotice> {
        let mut state = self.inner.lock();
        if state.finished {
            return None;
        }
        if Handle::try_current().is_err() {
            warn!("no tokio runtime; idle transaction will only finish when finish is called");
            return None;
        }
        let weak = Arc::downgrade(&self.inner);
        let idle = state.idle.as_mut()?;
        idle.final_timer = spawn_timer(weak.clone(), TimerKind::Final, idle.options.final_timeout);
        idle.heartbeat_timer = spawn_timer(
            weak,
            TimerKind::Heartbeat,
            idle.options.heartbeat_interval,
        );
        self.schedule_idle(idle)
    }

    fn schedule_idle(&self, idle: &mut IdleState) -> Option<ScheduleNotice> {
        idle.cancel_idle_timer();
        let delay = idle.options.idle_timeout;
        idle.idle_timer = spawn_timer(
            Arc::downgrade(&self.inner),
            TimerKind::Idle(idle.generation),
            delay,
        );
        idle.options
            .on_schedule_timeout
            .clone()
            .map(|callback| ScheduleNotice { callback, delay })
    }

    pub(crate) fn pop_activity(
        &self,
        state: &mut TransactionState,
        span_id: &SpanId,
    ) -> Option<ScheduleNotice> {
        let idle = state.idle.as_mut()?;
        if !idle.activities.remove(span_id) || !idle.activities.is_empty() {
            return None;
        }
        self.schedule_idle(idle)
    }

    /// Returns whether the timer should keep running.
    pub(crate) fn on_timer(&self, kind: TimerKind) -> bool {
        let event = {
            let mut state = self.inner.lock();
            if state.finished {
                return false;
            }
            let Some(idle) = state.idle.as_mut() else {
                return false;
            };
            match kind {
                TimerKind::Idle(generation) => {
                    if generation != idle.generation || !idle.activities.is_empty() {
                        debug!(generation, "stale idle timer ignored");
                        return false;
                    }
                    let end = state
                        .latest_child_end()
                        .unwrap_or(state.root.start_timestamp);
                    self.finish_locked(&mut state, Some(end), FinishCause::IdleTimeout)
                }
                TimerKind::Heartbeat => {
                    if !idle.beat() {
                        return true;
                    }
                    warn!(
                        interval = ?idle.options.heartbeat_interval,
                        "heartbeat failed; finishing transaction"
                    );
                    self.finish_locked(&mut state, None, FinishCause::HeartbeatFailed)
                }
                TimerKind::Final => {
                    let final_timeout = idle.options.final_timeout;
                    let end = state.root.start_timestamp + final_timeout.as_secs_f64();
                    debug!("max transaction duration reached");
                    self.finish_locked(&mut state, Some(end), FinishCause::FinalTimeout)
                }
            }
        };
        self.deliver(event);
        false
    }
}

/// A transaction that finishes itself once its children go quiet, its
/// heartbeat stalls, or its final timeout passes.
#[derive(Debug, Clone)]
pub struct IdleTransaction {
    transaction: Transaction,
}

impl IdleTransaction {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self { transaction }
    }

    /// Number of open child spans.
    pub fn activity_count(&self) -> usize {
        self.inner
            .lock()
            .idle
            .as_ref()
            .map_or(0, |idle| idle.activities.len())
    }

    pub fn options(&self) -> Option<IdleOptions> {
        self.inner
            .lock()
            .idle
            .as_ref()
            .map(|idle| idle.options.clone())
    }

    pub fn into_transaction(self) -> Transaction {
        self.transaction
    }
}

impl Deref for IdleTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.transaction
    }
}

impl From<IdleTransaction> for Transaction {
    fn from(idle: IdleTransaction) -> Self {
        idle.transaction
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pagetrace_core::status::SpanStatus;

    use super::*;
    use crate::context::{SpanContext, TransactionContext};
    use crate::sink::RecordingSink;
    use crate::tracer::Tracer;
    use crate::transaction::{HEARTBEAT_TAG, MAX_DURATION_EXCEEDED_TAG};

    fn tracer(sink: Arc<RecordingSink>) -> Tracer {
        Tracer::builder().sink(sink).build()
    }

    fn ctx() -> TransactionContext {
        TransactionContext {
            sampled: Some(true),
            ..TransactionContext::new("/home", "pageload")
        }
    }

    async fn advance(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finishes_after_default_idle_timeout() {
        let sink = Arc::new(RecordingSink::default());
        let tx = tracer(sink.clone()).start_idle_transaction(ctx(), IdleOptions::default());

        advance(999).await;
        assert!(!tx.is_finished());

        advance(1).await;
        assert!(tx.is_finished());
        assert_eq!(tx.end_timestamp(), Some(tx.start_timestamp()));
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_idle_timeout_is_respected() {
        let tx = tracer(Arc::default()).start_idle_transaction(
            ctx(),
            IdleOptions::default().with_idle_timeout(Duration::from_millis(2000)),
        );

        advance(1999).await;
        assert!(!tx.is_finished());
        advance(1).await;
        assert!(tx.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_finish_uses_last_child_end() {
        let sink = Arc::new(RecordingSink::default());
        let tx = tracer(sink.clone()).start_idle_transaction(ctx(), IdleOptions::default());

        let first = tx.start_child(SpanContext::new("http"));
        let second = tx.start_child(SpanContext::new("http"));
        assert_eq!(tx.activity_count(), 2);

        advance(300).await;
        first.finish();
        advance(400).await;
        second.finish();
        let last_end = second.end_timestamp().unwrap();

        advance(999).await;
        assert!(!tx.is_finished());
        advance(1).await;

        assert!(tx.is_finished());
        assert_eq!(tx.end_timestamp(), Some(last_end));
        assert_eq!(sink.events()[0].timestamp, last_end);
    }

    #[tokio::test(start_paused = true)]
    async fn new_child_cancels_pending_idle_timer() {
        let tx = tracer(Arc::default()).start_idle_transaction(ctx(), IdleOptions::default());

        advance(500).await;
        let span = tx.start_child(SpanContext::new("db"));
        advance(2000).await;
        assert!(!tx.is_finished());
        assert_eq!(tx.activity_count(), 1);

        span.finish();
        advance(999).await;
        assert!(!tx.is_finished());
        advance(1).await;
        assert!(tx.is_finished());
        assert_eq!(tx.end_timestamp(), span.end_timestamp());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fails_when_activity_is_stuck() {
        let sink = Arc::new(RecordingSink::default());
        let tx = tracer(sink.clone()).start_idle_transaction(ctx(), IdleOptions::default());
        let _stuck = tx.start_child(SpanContext::new("http"));

        advance(14_999).await;
        assert!(!tx.is_finished());
        advance(1).await;

        assert!(tx.is_finished());
        assert_eq!(tx.status(), Some(SpanStatus::DeadlineExceeded));
        assert_eq!(tx.tag(HEARTBEAT_TAG).as_deref(), Some("failed"));
        let event = sink.events().pop().unwrap();
        assert_eq!(event.spans[0].status, Some(SpanStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn changing_activity_keeps_heartbeat_alive() {
        let tx = tracer(Arc::default()).start_idle_transaction(ctx(), IdleOptions::default());
        let mut current = tx.start_child(SpanContext::new("http"));

        for _ in 0..5 {
            advance(4_000).await;
            let next = tx.start_child(SpanContext::new("http"));
            current.finish();
            current = next;
        }

        assert!(!tx.is_finished());
        assert_eq!(tx.tag(HEARTBEAT_TAG), None);
    }

    #[tokio::test(start_paused = true)]
    async fn final_timeout_finishes_with_deadline() {
        let sink = Arc::new(RecordingSink::default());
        let options = IdleOptions::default()
            .with_final_timeout(Duration::from_secs(30))
            .with_heartbeat_interval(Duration::from_secs(3600));
        let tx = tracer(sink.clone()).start_idle_transaction(ctx(), options);
        let _open = tx.start_child(SpanContext::new("long"));

        advance(29_999).await;
        assert!(!tx.is_finished());
        advance(1).await;

        assert!(tx.is_finished());
        assert_eq!(tx.status(), Some(SpanStatus::DeadlineExceeded));
        assert_eq!(tx.tag(MAX_DURATION_EXCEEDED_TAG).as_deref(), Some("true"));
        assert_eq!(tx.end_timestamp(), Some(tx.start_timestamp() + 30.0));
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_finish_stops_timers() {
        let sink = Arc::new(RecordingSink::default());
        let tx = tracer(sink.clone()).start_idle_transaction(ctx(), IdleOptions::default());
        let _open = tx.start_child(SpanContext::new("http"));

        tx.finish();
        advance(60_000).await;

        assert_eq!(sink.events().len(), 1);
        assert_eq!(tx.tag(HEARTBEAT_TAG), None);
        assert_eq!(tx.activity_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_callback_sees_every_reschedule() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let options = IdleOptions::default()
            .on_schedule_timeout(move |delay| recorder.lock().unwrap().push(delay));
        let tx = tracer(Arc::default()).start_idle_transaction(ctx(), options);

        tx.start_child(SpanContext::new("a")).finish();
        tx.start_child(SpanContext::new("b")).finish();

        assert_eq!(*seen.lock().unwrap(), vec![DEFAULT_IDLE_TIMEOUT; 3]);
    }

    #[test]
    fn normalize_restores_zero_durations() {
        let mut options = IdleOptions::default()
            .with_idle_timeout(Duration::ZERO)
            .with_final_timeout(Duration::ZERO)
            .with_heartbeat_interval(Duration::ZERO);

        let adjusted = options.normalize();

        assert_eq!(
            adjusted,
            vec!["idle_timeout", "final_timeout", "heartbeat_interval"]
        );
        assert_eq!(options.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(options.final_timeout, DEFAULT_MAX_TRANSACTION_DURATION);
        assert_eq!(options.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_heartbeat_interval_falls_back_to_default() {
        let tx = tracer(Arc::default()).start_idle_transaction(
            ctx(),
            IdleOptions::default().with_heartbeat_interval(Duration::ZERO),
        );
        let _open = tx.start_child(SpanContext::new("http"));

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(!tx.is_finished());
        assert_eq!(
            tx.options().map(|o| o.heartbeat_interval),
            Some(DEFAULT_HEARTBEAT_INTERVAL)
        );

        advance(14_999).await;
        assert!(!tx.is_finished());
        advance(1).await;
        assert_eq!(tx.tag(HEARTBEAT_TAG).as_deref(), Some("failed"));
    }

    #[test]
    fn without_runtime_only_manual_finish_applies() {
        let sink = Arc::new(RecordingSink::default());
        let tx = tracer(sink.clone()).start_idle_transaction(ctx(), IdleOptions::default());
        assert!(!tx.is_finished());
        tx.finish();
        assert_eq!(sink.events().len(), 1);
    }
}
