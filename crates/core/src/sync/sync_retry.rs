//! Retry classification, backoff and dead-letter policy for queue delivery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry policy classification for delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

impl SyncRetryClass {
    pub fn code(&self) -> &'static str {
        match self {
            SyncRetryClass::Retryable => "retryable",
            SyncRetryClass::Permanent => "permanent",
            SyncRetryClass::ReauthRequired => "reauth_required",
        }
    }
}

/// Error code for transport failures where the remote was never reached.
pub const NETWORK_ERROR_CODE: &str = "network_unreachable";

/// Delivery failure reported by a remote authority implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DeliveryError {
    pub class: SyncRetryClass,
    pub message: String,
    pub code: Option<String>,
}

impl DeliveryError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: SyncRetryClass::Retryable,
            message: message.into(),
            code: None,
        }
    }

    /// The remote authority could not be reached at all.
    pub fn network(message: impl Into<String>) -> Self {
        Self::retryable(message).with_code(NETWORK_ERROR_CODE)
    }

    pub fn is_network(&self) -> bool {
        self.code.as_deref() == Some(NETWORK_ERROR_CODE)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: SyncRetryClass::Permanent,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Error code persisted on the queue entry.
    pub fn error_code(&self) -> String {
        self.code
            .clone()
            .unwrap_or_else(|| self.class.code().to_string())
    }
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 423 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Exponential backoff in seconds with cap.
pub fn backoff_seconds(consecutive_failures: i32) -> i64 {
    const MAX_EXPONENT: i32 = 8;
    const BASE_DELAY_SECONDS: i64 = 5;

    let capped = i64::from(consecutive_failures.clamp(0, MAX_EXPONENT));
    2_i64.pow(capped as u32) * BASE_DELAY_SECONDS
}

/// Fixed delay before retrying after an auth failure.
pub const REAUTH_RETRY_DELAY_SECS: i64 = 30;

/// What to do with a queue entry after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter { seconds: i64 },
    DeadLetter,
}

/// Decides the next step for an entry that has already failed `retry_count` times
/// before this attempt.
pub fn retry_decision(
    class: SyncRetryClass,
    retry_count: i32,
    max_delivery_attempts: i32,
) -> RetryDecision {
    let attempts = retry_count.saturating_add(1);
    match class {
        SyncRetryClass::Permanent => RetryDecision::DeadLetter,
        _ if max_delivery_attempts > 0 && attempts >= max_delivery_attempts => {
            RetryDecision::DeadLetter
        }
        SyncRetryClass::ReauthRequired => RetryDecision::RetryAfter {
            seconds: REAUTH_RETRY_DELAY_SECS,
        },
        SyncRetryClass::Retryable => RetryDecision::RetryAfter {
            seconds: backoff_seconds(retry_count),
        },
    }
}
