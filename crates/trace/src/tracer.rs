use std::sync::Arc;

use pagetrace_core::config::{Config, DEFAULT_MAX_SPANS};

use crate::clock::{Clock, MonotonicClock};
use crate::context::TransactionContext;
use crate::idle::{IdleOptions, IdleState, IdleTransaction};
use crate::sampler::Sampler;
use crate::sink::{NoopSink, TransactionSink};
use crate::transaction::{Transaction, TransactionSetup};

/// Entry point for starting transactions. Cheap to clone.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    sampler: Option<Sampler>,
    sink: Arc<dyn TransactionSink>,
    clock: Arc<dyn Clock>,
    max_spans: usize,
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// Rate sampler from `traces_sample_rate`; no rate means nothing is sampled.
    pub fn from_config(config: &Config, sink: Arc<dyn TransactionSink>) -> Self {
        let mut builder = Self::builder().sink(sink).max_spans(config.max_spans);
        if let Some(rate) = config.traces_sample_rate {
            builder = builder.sampler(Sampler::rate(rate));
        }
        builder.build()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn start_transaction(&self, ctx: TransactionContext) -> Transaction {
        Transaction::new(ctx, self.setup(), None, None)
    }

    /// Starts a transaction that finishes itself; timers need a tokio runtime.
    pub fn start_idle_transaction(
        &self,
        ctx: TransactionContext,
        mut options: IdleOptions,
    ) -> IdleTransaction {
        options.normalize();
        let max_duration = Some(options.final_timeout);
        let transaction =
            Transaction::new(ctx, self.setup(), max_duration, Some(IdleState::new(options)));
        if let Some(notice) = transaction.start_idle_timers() {
            notice.notify();
        }
        IdleTransaction::new(transaction)
    }

    fn setup(&self) -> TransactionSetup<'_> {
        TransactionSetup {
            sampler: self.inner.sampler.as_ref(),
            sink: self.inner.sink.clone(),
            clock: self.inner.clock.clone(),
            max_spans: self.inner.max_spans,
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("sampler", &self.inner.sampler)
            .field("clock", &self.inner.clock)
            .field("max_spans", &self.inner.max_spans)
            .finish_non_exhaustive()
    }
}

pub struct TracerBuilder {
    sampler: Option<Sampler>,
    sink: Arc<dyn TransactionSink>,
    clock: Arc<dyn Clock>,
    max_spans: usize,
}

impl Default for TracerBuilder {
    fn default() -> Self {
        Self {
            sampler: None,
            sink: Arc::new(NoopSink),
            clock: Arc::new(MonotonicClock::new()),
            max_spans: DEFAULT_MAX_SPANS,
        }
    }
}

impl TracerBuilder {
    pub fn sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TransactionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_spans(mut self, max_spans: usize) -> Self {
        self.max_spans = max_spans.max(1);
        self
    }

    pub fn build(self) -> Tracer {
        Tracer {
            inner: Arc::new(TracerInner {
                sampler: self.sampler,
                sink: self.sink,
                clock: self.clock,
                max_spans: self.max_spans,
            }),
        }
    }
}
