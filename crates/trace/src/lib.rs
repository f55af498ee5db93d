pub mod clock;
pub mod context;
pub mod idle;
pub mod routing;
pub mod sampler;
pub mod scope;
pub mod sink;
pub mod span;
pub mod tracer;
pub mod transaction;

pub use clock::{Clock, MonotonicClock};
pub use context::{SamplingContext, SpanContext, TransactionContext, TransactionMetadata};
pub use idle::{IdleOptions, IdleTransaction};
pub use routing::{MetaSource, RouteTracer, RouteTracerOptions};
pub use sampler::Sampler;
pub use scope::{TraceScope, active_transaction};
pub use sink::{NoopSink, TransactionSink};
pub use span::Span;
pub use tracer::{Tracer, TracerBuilder};
pub use transaction::Transaction;
