use std::fmt;

/// Outcome class of a delivery attempt, derived from the HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Unknown,
    Success,
    RateLimit,
    Invalid,
    Failed,
}

impl Status {
    pub fn from_http_code(code: u16) -> Self {
        match code {
            200..=299 => Self::Success,
            429 => Self::RateLimit,
            400..=499 => Self::Invalid,
            500.. => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Success => "success",
            Self::RateLimit => "rate_limit",
            Self::Invalid => "invalid",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
