pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod status;
pub mod time;
pub mod trace_header;

pub use error::{PagetraceError, Result};
pub use ids::{SpanId, TraceId};
pub use status::SpanStatus;
pub use trace_header::TraceHeader;
