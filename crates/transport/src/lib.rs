pub mod buffer;
pub mod error;
pub mod retry_after;
pub mod sender;
pub mod sink;
pub mod status;
pub mod transport;

pub use buffer::{BufferSlot, PromiseBuffer};
pub use error::SendError;
pub use sender::{HttpResponse, HttpSender, OutboundRequest, ReqwestSender};
pub use sink::DeliverySink;
pub use status::Status;
pub use transport::{Transport, TransportOptions};
