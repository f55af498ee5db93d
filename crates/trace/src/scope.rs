use std::sync::{Arc, Mutex};

use crate::transaction::Transaction;

/// Holds the transaction instrumentation should attach spans to. Passed
/// explicitly; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct TraceScope {
    slot: Arc<Mutex<Option<Transaction>>>,
}

impl TraceScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transaction previously in the slot, if any.
    pub fn set_active(&self, transaction: Transaction) -> Option<Transaction> {
        self.slot
            .lock()
            .expect("trace scope poisoned")
            .replace(transaction)
    }

    pub fn clear(&self) -> Option<Transaction> {
        self.slot.lock().expect("trace scope poisoned").take()
    }

    /// The current transaction, unless it has already finished.
    pub fn active_transaction(&self) -> Option<Transaction> {
        self.slot
            .lock()
            .expect("trace scope poisoned")
            .as_ref()
            .filter(|tx| !tx.is_finished())
            .cloned()
    }
}

pub fn active_transaction(scope: &TraceScope) -> Option<Transaction> {
    scope.active_transaction()
}
