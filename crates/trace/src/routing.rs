use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use pagetrace_core::config::{
    Config, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_TRANSACTION_DURATION,
    default_tracing_origins,
};
use pagetrace_core::status::SpanStatus;
use pagetrace_core::trace_header::TRACE_HEADER_NAME;
use regex::Regex;
use tracing::{debug, warn};

use crate::context::TransactionContext;
use crate::idle::{IdleOptions, IdleTransaction};
use crate::scope::TraceScope;
use crate::tracer::Tracer;
use crate::transaction::Transaction;

pub const PAGELOAD_OP: &str = "pageload";
pub const NAVIGATION_OP: &str = "navigation";
pub const VISIBILITY_TAG: &str = "visibilitychange";

pub type BeforeNavigate = dyn Fn(TransactionContext) -> Option<TransactionContext> + Send + Sync;

/// Reads `<meta name=...>` style values from the host page.
pub trait MetaSource {
    fn meta_content(&self, name: &str) -> Option<String>;
}

impl MetaSource for HashMap<String, String> {
    fn meta_content(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl MetaSource for BTreeMap<String, String> {
    fn meta_content(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

#[derive(Clone)]
pub struct RouteTracerOptions {
    pub idle_timeout: Duration,
    pub max_transaction_duration: Duration,
    pub heartbeat_interval: Duration,
    pub start_transaction_on_page_load: bool,
    pub start_transaction_on_location_change: bool,
    pub mark_background_transactions: bool,
    /// May rewrite the context; returning `None` skips the transaction.
    pub before_navigate: Option<Arc<BeforeNavigate>>,
    pub tracing_origins: Vec<String>,
}

impl Default for RouteTracerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_transaction_duration: DEFAULT_MAX_TRANSACTION_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            start_transaction_on_page_load: true,
            start_transaction_on_location_change: true,
            mark_background_transactions: true,
            before_navigate: None,
            tracing_origins: default_tracing_origins(),
        }
    }
}

impl RouteTracerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            max_transaction_duration: config.max_transaction_duration,
            heartbeat_interval: config.heartbeat_interval,
            start_transaction_on_page_load: config.start_transaction_on_page_load,
            start_transaction_on_location_change: config.start_transaction_on_location_change,
            mark_background_transactions: config.mark_background_transactions,
            before_navigate: None,
            tracing_origins: config.tracing_origins.clone(),
        }
    }

    pub fn before_navigate<F>(mut self, f: F) -> Self
    where
        F: Fn(TransactionContext) -> Option<TransactionContext> + Send + Sync + 'static,
    {
        self.before_navigate = Some(Arc::new(f));
        self
    }

    fn idle_options(&self) -> IdleOptions {
        IdleOptions::default()
            .with_idle_timeout(self.idle_timeout)
            .with_final_timeout(self.max_transaction_duration)
            .with_heartbeat_interval(self.heartbeat_interval)
    }
}

impl fmt::Debug for RouteTracerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTracerOptions")
            .field("idle_timeout", &self.idle_timeout)
            .field("max_transaction_duration", &self.max_transaction_duration)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field(
                "start_transaction_on_page_load",
                &self.start_transaction_on_page_load,
            )
            .field(
                "start_transaction_on_location_change",
                &self.start_transaction_on_location_change,
            )
            .field(
                "mark_background_transactions",
                &self.mark_background_transactions,
            )
            .field("before_navigate", &self.before_navigate.is_some())
            .field("tracing_origins", &self.tracing_origins)
            .finish()
    }
}

#[derive(Debug)]
enum OriginMatcher {
    Contains(String),
    Pattern(Regex),
}

impl OriginMatcher {
    fn compile(origin: &str) -> Self {
        if origin.starts_with('^') {
            match Regex::new(origin) {
                Ok(re) => return Self::Pattern(re),
                Err(error) => {
                    warn!(origin, error = %error, "invalid tracing origin pattern; matching literally")
                }
            }
        }
        Self::Contains(origin.to_string())
    }

    fn matches(&self, url: &str) -> bool {
        match self {
            Self::Contains(needle) => url.contains(needle.as_str()),
            Self::Pattern(re) => re.is_match(url),
        }
    }
}

/// Turns page lifecycle signals into idle transactions.
#[derive(Debug)]
pub struct RouteTracer {
    tracer: Tracer,
    options: RouteTracerOptions,
    scope: TraceScope,
    origins: Vec<OriginMatcher>,
}

impl RouteTracer {
    pub fn new(tracer: Tracer, mut options: RouteTracerOptions) -> Self {
        options.tracing_origins.retain(|o| !o.trim().is_empty());
        if options.tracing_origins.is_empty() {
            warn!("tracing_origins is empty; falling back to default origins");
            options.tracing_origins = default_tracing_origins();
        }
        let origins = options
            .tracing_origins
            .iter()
            .map(|o| OriginMatcher::compile(o))
            .collect();
        Self {
            tracer,
            options,
            scope: TraceScope::new(),
            origins,
        }
    }

    pub fn options(&self) -> &RouteTracerOptions {
        &self.options
    }

    pub fn scope(&self) -> &TraceScope {
        &self.scope
    }

    pub fn active_transaction(&self) -> Option<Transaction> {
        self.scope.active_transaction()
    }

    /// Starts the `pageload` transaction, continuing the trace found in the
    /// page's `sentry-trace` meta value.
    pub fn start_page_load(
        &self,
        location: &str,
        meta: &dyn MetaSource,
    ) -> Option<IdleTransaction> {
        if !self.options.start_transaction_on_page_load {
            return None;
        }
        let header = meta.meta_content(TRACE_HEADER_NAME);
        let ctx = TransactionContext::continue_from_header(location, PAGELOAD_OP, header.as_deref());
        self.start_route(ctx)
    }

    /// Finishes the current transaction and starts a `navigation` one. A
    /// change without a previous location is the initial load and is ignored.
    pub fn on_location_change(&self, from: Option<&str>, to: &str) -> Option<IdleTransaction> {
        if !self.options.start_transaction_on_location_change {
            return None;
        }
        let Some(from) = from else {
            debug!(to, "location change without previous location ignored");
            return None;
        };
        if let Some(previous) = self.scope.clear() {
            debug!(from, name = %previous.name(), "finishing transaction on navigation");
            previous.finish();
        }
        let mut ctx = TransactionContext::new(to, NAVIGATION_OP);
        ctx.tags.insert("from".to_string(), from.to_string());
        self.start_route(ctx)
    }

    /// The page went to the background; timings are no longer trustworthy.
    pub fn on_hidden(&self) {
        if !self.options.mark_background_transactions {
            return;
        }
        let Some(tx) = self.scope.active_transaction() else {
            return;
        };
        debug!(name = %tx.name(), "page hidden; finishing active transaction");
        if tx.status().is_none() {
            tx.set_status(SpanStatus::Cancelled);
        }
        tx.set_tag(VISIBILITY_TAG, "document.hidden");
        tx.finish();
        self.scope.clear();
    }

    pub fn should_trace_request(&self, url: &str) -> bool {
        self.origins.iter().any(|o| o.matches(url))
    }

    fn start_route(&self, mut ctx: TransactionContext) -> Option<IdleTransaction> {
        ctx.trim_end = true;
        if let Some(before_navigate) = &self.options.before_navigate {
            match before_navigate(ctx) {
                Some(rewritten) => ctx = rewritten,
                None => {
                    debug!("before_navigate returned None; transaction skipped");
                    return None;
                }
            }
        }
        let tx = self
            .tracer
            .start_idle_transaction(ctx, self.options.idle_options());
        self.scope.set_active(Transaction::clone(&tx));
        Some(tx)
    }
}
