use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::SendError;

/// Bounded set of in-flight deliveries. Admission is decided synchronously,
/// so a full buffer rejects new work before any of it runs.
#[derive(Debug, Clone)]
pub struct PromiseBuffer {
    limit: usize,
    in_flight: Arc<watch::Sender<usize>>,
}

/// Occupies one buffer slot until dropped.
#[derive(Debug)]
pub struct BufferSlot {
    in_flight: Arc<watch::Sender<usize>>,
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        self.in_flight.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl PromiseBuffer {
    pub fn new(limit: usize) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            limit,
            in_flight: Arc::new(in_flight),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether another task would currently be admitted.
    pub fn is_ready(&self) -> bool {
        self.len() < self.limit
    }

    pub fn reserve(&self) -> Result<BufferSlot, SendError> {
        let limit = self.limit;
        let mut admitted = false;
        self.in_flight.send_if_modified(|count| {
            if *count >= limit {
                return false;
            }
            *count += 1;
            admitted = true;
            true
        });
        if !admitted {
            debug!(limit, "promise buffer full");
            return Err(SendError::BufferFull { limit });
        }
        Ok(BufferSlot {
            in_flight: self.in_flight.clone(),
        })
    }

    /// Admits `task` or fails with `BufferFull`. The slot is released when
    /// the returned future completes or is dropped.
    pub fn add<F>(&self, task: F) -> Result<impl Future<Output = F::Output> + Send + 'static, SendError>
    where
        F: Future + Send + 'static,
    {
        let slot = self.reserve()?;
        Ok(async move {
            let output = task.await;
            drop(slot);
            output
        })
    }

    /// Waits until nothing is in flight. Returns false if `timeout` ran out first.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.in_flight.subscribe();
        let idle = async move { rx.wait_for(|count| *count == 0).await.is_ok() };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, idle)
                .await
                .unwrap_or(false),
            None => idle.await,
        }
    }
}
