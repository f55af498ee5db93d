pub mod event;
pub mod span;

pub use event::{EventContexts, TraceContext, TransactionEvent};
pub use span::SpanRecord;
