use std::time::Duration;

use pagetrace_core::model::TransactionEvent;
use pagetrace_trace::TransactionSink;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::sender::{HttpSender, ReqwestSender};
use crate::transport::Transport;

/// Production sink: every captured transaction is sent through the
/// transport on the tokio runtime. Failures are logged, never raised.
pub struct DeliverySink<S = ReqwestSender> {
    transport: Transport<S>,
    runtime: Option<Handle>,
}

impl<S: HttpSender> DeliverySink<S> {
    /// Remembers the current runtime, if any, for captures made from
    /// threads outside it.
    pub fn new(transport: Transport<S>) -> Self {
        Self {
            transport,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    pub async fn flush(&self, timeout: Duration) -> bool {
        self.transport.close(timeout).await
    }
}

impl<S: HttpSender> TransactionSink for DeliverySink<S> {
    fn capture(&self, event: TransactionEvent) {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            warn!(
                event_id = %event.event_id,
                "no tokio runtime available; dropping transaction"
            );
            return;
        };
        let event_id = event.event_id.clone();
        let transaction = event.transaction.clone();
        let delivery = self.transport.send_event(&event);
        runtime.spawn(async move {
            match delivery.await {
                Ok(status) => debug!(event_id = %event_id, %status, "transaction delivered"),
                Err(error) => warn!(
                    event_id = %event_id,
                    transaction = %transaction,
                    error = %error,
                    "failed to deliver transaction"
                ),
            }
        });
    }
}
