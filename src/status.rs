//! Processing lifecycle states for a metadata record.

use serde::{Deserialize, Serialize};

/// Status of a URL's record in the inventory.
///
/// `Completed` and `FailedPermanent` are terminal for a processing
/// trajectory; everything else means the pipeline may still touch the record.
/// Unrecognized strings from storage deserialize to `Unknown` so a reader can
/// fall back to re-enqueueing rather than failing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Queued,
    Pending,
    InProgress,
    Completed,
    FailedRetryable,
    FailedPermanent,
    #[serde(other)]
    Unknown,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::FailedRetryable => "FAILED_RETRYABLE",
            Self::FailedPermanent => "FAILED_PERMANENT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a stored status string; anything unrecognized maps to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value {
            "QUEUED" => Self::Queued,
            "PENDING" => Self::Pending,
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED" => Self::Completed,
            "FAILED_RETRYABLE" => Self::FailedRetryable,
            "FAILED_PERMANENT" => Self::FailedPermanent,
            _ => Self::Unknown,
        }
    }

    /// Terminal statuses stop the retry loop for a URL.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedPermanent)
    }

    /// Statuses a lookup reports uniformly as "in progress".
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Pending | Self::InProgress | Self::FailedRetryable)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
