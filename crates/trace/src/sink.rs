use pagetrace_core::model::TransactionEvent;

/// Receives every finished, sampled transaction.
///
/// Called synchronously from `finish`, which may run on a timer task, so
/// implementations must not block.
pub trait TransactionSink: Send + Sync {
    fn capture(&self, event: TransactionEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TransactionSink for NoopSink {
    fn capture(&self, _event: TransactionEvent) {}
}

/// Records captured events for assertions.
// Unit tests can't use `testkit::RecordingSink`: testkit depends on this crate,
// so its types differ from the ones compiled into the test build.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: std::sync::Mutex<Vec<TransactionEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl TransactionSink for RecordingSink {
    fn capture(&self, event: TransactionEvent) {
        self.events.lock().unwrap().push(event);
    }
}
