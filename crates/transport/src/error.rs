use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::sender::HttpResponse;
use crate::status::Status;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("transport buffer is full ({limit} requests in flight)")]
    BufferFull { limit: usize },

    #[error("{reason}")]
    RateLimited {
        reason: String,
        until: DateTime<Utc>,
    },

    #[error("collector responded with HTTP {} ({status})", .response.status)]
    Rejected {
        status: Status,
        response: HttpResponse,
    },

    #[error("request failed: {0}")]
    Network(String),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SendError {
    /// The collector's response, for rejections that got one.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::Rejected { response, .. } => Some(response),
            _ => None,
        }
    }
}
