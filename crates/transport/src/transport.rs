use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use pagetrace_core::config::{Config, DEFAULT_BUFFER_SIZE, DEFAULT_RETRY_AFTER};
use pagetrace_core::error::{PagetraceError, Result};
use pagetrace_core::model::TransactionEvent;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::PromiseBuffer;
use crate::error::SendError;
use crate::retry_after::{RETRY_AFTER_HEADER, parse_retry_after};
use crate::sender::{HttpSender, OutboundRequest, ReqwestSender};
use crate::status::Status;

pub const CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Upper bound on a lockout so a hostile Retry-After cannot overflow the clock.
const MAX_LOCKOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub buffer_size: usize,
    pub default_retry_after: Duration,
    pub request_timeout: Duration,
}

impl TransportOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            default_retry_after: DEFAULT_RETRY_AFTER,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| PagetraceError::Config("endpoint is not configured".to_string()))?;
        Ok(Self {
            endpoint,
            headers: config.headers.clone(),
            buffer_size: config.transport_buffer_size,
            default_retry_after: config.default_retry_after,
            request_timeout: config.request_timeout,
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_default_retry_after(mut self, delay: Duration) -> Self {
        self.default_retry_after = delay;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Lockout {
    until: Instant,
    until_wall: DateTime<Utc>,
}

struct TransportInner<S> {
    sender: S,
    options: TransportOptions,
    buffer: PromiseBuffer,
    lockout: Mutex<Option<Lockout>>,
}

/// Ships finished transactions to the collector, backing off after 429s.
/// Cheap to clone; clones share the buffer and the lockout.
pub struct Transport<S = ReqwestSender> {
    inner: Arc<TransportInner<S>>,
}

impl<S> Clone for Transport<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Transport<ReqwestSender> {
    pub fn from_config(config: &Config) -> Result<Self> {
        let options = TransportOptions::from_config(config)?;
        let sender = ReqwestSender::new(options.request_timeout);
        Ok(Self::new(sender, options))
    }
}

impl<S: HttpSender> Transport<S> {
    pub fn new(sender: S, options: TransportOptions) -> Self {
        let buffer = PromiseBuffer::new(options.buffer_size);
        Self {
            inner: Arc::new(TransportInner {
                sender,
                options,
                buffer,
                lockout: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    pub fn buffer(&self) -> &PromiseBuffer {
        &self.inner.buffer
    }

    pub fn sender(&self) -> &S {
        &self.inner.sender
    }

    /// Wall-clock end of the current rate-limit lockout, if one is active.
    pub fn disabled_until(&self) -> Option<DateTime<Utc>> {
        self.inner.active_lockout().map(|l| l.until_wall)
    }

    /// Lockout check, serialization and buffer admission happen before this
    /// returns; only the request itself runs inside the returned future.
    pub fn send_event(
        &self,
        event: &TransactionEvent,
    ) -> impl Future<Output = std::result::Result<Status, SendError>> + Send + 'static {
        let queued = self.enqueue(event);
        async move { queued?.await }
    }

    fn enqueue(
        &self,
        event: &TransactionEvent,
    ) -> std::result::Result<
        impl Future<Output = std::result::Result<Status, SendError>> + Send + 'static,
        SendError,
    > {
        if let Some(lockout) = self.inner.active_lockout() {
            let until = lockout.until_wall;
            return Err(SendError::RateLimited {
                reason: format!(
                    "Transport locked till {} due to too many requests.",
                    until.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
                until,
            });
        }

        let body = serde_json::to_vec(event)?;
        let mut headers = vec![("content-type".to_string(), CONTENT_TYPE.to_string())];
        headers.extend(self.inner.options.headers.iter().cloned());
        let request = OutboundRequest {
            url: self.inner.options.endpoint.clone(),
            headers,
            body,
        };

        let inner = self.inner.clone();
        let event_id = event.event_id.clone();
        self.inner.buffer.add(async move {
            let result = inner.deliver(request).await;
            debug!(event_id = %event_id, ok = result.is_ok(), "delivery settled");
            result
        })
    }

    /// Waits for in-flight deliveries. Returns false if `timeout` elapsed first.
    pub async fn close(&self, timeout: Duration) -> bool {
        let drained = self.inner.buffer.drain(Some(timeout)).await;
        if !drained {
            warn!(
                in_flight = self.inner.buffer.len(),
                ?timeout,
                "transport closed with deliveries still in flight"
            );
        }
        drained
    }
}

impl<S> TransportInner<S> {
    fn active_lockout(&self) -> Option<Lockout> {
        let lockout = self.lockout.lock().expect("transport lockout poisoned");
        lockout.filter(|l| Instant::now() < l.until)
    }

    /// The most recent 429 decides the lockout, even if it is shorter.
    fn lock_for(&self, delay: Duration) -> DateTime<Utc> {
        let delay = delay.min(MAX_LOCKOUT);
        let until_wall = Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
        let lockout = Lockout {
            until: Instant::now() + delay,
            until_wall,
        };
        *self.lockout.lock().expect("transport lockout poisoned") = Some(lockout);
        until_wall
    }
}

impl<S: HttpSender> TransportInner<S> {
    async fn deliver(&self, request: OutboundRequest) -> std::result::Result<Status, SendError> {
        let response = self.sender.send(request).await?;
        let status = Status::from_http_code(response.status);
        match status {
            Status::Success => Ok(status),
            Status::RateLimit => {
                let delay = parse_retry_after(
                    Utc::now(),
                    response.header(RETRY_AFTER_HEADER),
                    self.options.default_retry_after,
                );
                let until = self.lock_for(delay);
                warn!(
                    until = %until.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "too many requests; backing off"
                );
                Err(SendError::Rejected { status, response })
            }
            _ => Err(SendError::Rejected { status, response }),
        }
    }
}
