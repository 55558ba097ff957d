//! # Message Sender
//!
//! Single-message delivery with progressive per-attempt timeouts, retry with
//! backoff, duplicate suppression, and error classification.
//!
//! ## Attempt loop
//!
//! - a duplicate (unless the number is on the bypass allow-list) returns a
//!   skipped result without calling the provider; the check reserves the
//!   (phone, content) pair, so concurrent identical sends collapse to a
//!   single provider call;
//! - attempts run while `attempts < max_attempts` (default 3);
//! - before each attempt after the first, sleep the backoff: the configured
//!   backoff minutes on the first retry, a fixed 60s interval thereafter;
//! - the provider call runs under a progressive timeout (10s / 20s / 30s);
//! - rate-limited attempts (HTTP 429) sleep an additional fixed cooldown
//!   before the next attempt, on top of the backoff;
//! - permanent errors (HTTP 400 / 401) stop retrying immediately;
//! - exhausted retries report `max_retries` with the last underlying error
//!   and its category preserved.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::duplicate_guard::DuplicateGuard;
use super::provider::{AuthContext, MessageProvider, ProviderError, RateLimitInfo};
use super::template::MessageTemplate;
use crate::constants::{
    DEFAULT_BACKOFF_MINUTES, DEFAULT_MAX_ATTEMPTS, PROGRESSIVE_TIMEOUTS_SECS,
    RATE_LIMIT_COOLDOWN, RETRY_INTERVAL,
};

/// Failure taxonomy for message and batch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 429 from the provider
    RateLimit,
    /// HTTP 400: the request itself is malformed, retrying cannot help
    InvalidRequest,
    /// Client-side timeout after the given number of seconds
    Timeout(u64),
    /// Connection-level failure
    NetworkError,
    /// HTTP 401: credentials rejected
    AuthError,
    /// Retry attempts exhausted
    MaxRetries,
    /// Send suppressed as a duplicate
    DuplicateSkip,
    /// Unclassified provider failure
    Unknown,
    /// Batch-level uncaught dispatch error
    System,
}

impl ErrorCategory {
    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Timeout(_) | Self::NetworkError | Self::Unknown
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate_limit"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Timeout(secs) => write!(f, "timeout_{secs}s"),
            Self::NetworkError => write!(f, "network_error"),
            Self::AuthError => write!(f, "auth_error"),
            Self::MaxRetries => write!(f, "max_retries"),
            Self::DuplicateSkip => write!(f, "duplicate_skip"),
            Self::Unknown => write!(f, "unknown"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit" => Ok(Self::RateLimit),
            "invalid_request" => Ok(Self::InvalidRequest),
            "network_error" => Ok(Self::NetworkError),
            "auth_error" => Ok(Self::AuthError),
            "max_retries" => Ok(Self::MaxRetries),
            "duplicate_skip" => Ok(Self::DuplicateSkip),
            "unknown" => Ok(Self::Unknown),
            "system" => Ok(Self::System),
            other => other
                .strip_prefix("timeout_")
                .and_then(|rest| rest.strip_suffix('s'))
                .and_then(|secs| secs.parse().ok())
                .map(Self::Timeout)
                .ok_or_else(|| format!("Invalid error category: {other}")),
        }
    }
}

impl Serialize for ErrorCategory {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ErrorCategory {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Retry behavior for a single message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, initial attempt included.
    pub max_attempts: u32,
    /// Backoff before the first retry, in minutes.
    pub backoff_minutes: u64,
    /// Fixed backoff between subsequent retries, in seconds.
    pub retry_interval_secs: u64,
    /// Extra cooldown after a rate-limited attempt, in seconds.
    pub rate_limit_cooldown_secs: u64,
    /// Allow the dispatcher to defer a terminally rate-limited message once.
    pub defer_on_rate_limit: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_minutes: DEFAULT_BACKOFF_MINUTES,
            retry_interval_secs: RETRY_INTERVAL.as_secs(),
            rate_limit_cooldown_secs: RATE_LIMIT_COOLDOWN.as_secs(),
            defer_on_rate_limit: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep before the given retry (1-based retry index).
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        if retry_index == 1 {
            Duration::from_secs(self.backoff_minutes * 60)
        } else {
            Duration::from_secs(self.retry_interval_secs)
        }
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

/// Reason a send was skipped without calling the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DuplicateMessage,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateMessage => write!(f, "duplicate_message"),
        }
    }
}

/// Outcome of a single-message send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendResult {
    Success {
        provider_message_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        attempts: u32,
    },
    Skipped {
        reason: SkipReason,
        attempts: u32,
    },
    Failed {
        error: String,
        category: ErrorCategory,
        /// Category of the last underlying error when `category` is
        /// `max_retries`.
        underlying: Option<ErrorCategory>,
        rate_limit: Option<RateLimitInfo>,
        attempts: u32,
    },
}

impl SendResult {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Skipped { attempts, .. }
            | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Classify a provider failure into the error taxonomy.
pub fn classify(err: &ProviderError) -> ErrorCategory {
    match err {
        ProviderError::Http { status: 429, .. } => ErrorCategory::RateLimit,
        ProviderError::Http { status: 400, .. } => ErrorCategory::InvalidRequest,
        ProviderError::Http { status: 401, .. } => ErrorCategory::AuthError,
        ProviderError::Http { .. } => ErrorCategory::Unknown,
        ProviderError::Connection(_) => ErrorCategory::NetworkError,
    }
}

/// Provider call timeout for a 1-based attempt number.
pub fn progressive_timeout(attempt: u32) -> Duration {
    let idx = (attempt.max(1) as usize - 1).min(PROGRESSIVE_TIMEOUTS_SECS.len() - 1);
    Duration::from_secs(PROGRESSIVE_TIMEOUTS_SECS[idx])
}

/// Single-message sender shared by all dispatcher workers.
pub struct MessageSender {
    provider: Arc<dyn MessageProvider>,
    guard: Arc<DuplicateGuard>,
    policy: RetryPolicy,
}

impl MessageSender {
    pub fn new(
        provider: Arc<dyn MessageProvider>,
        guard: Arc<DuplicateGuard>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            guard,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drop the in-flight reservation for a message whose send task died
    /// before settling it.
    pub fn release_reservation(
        &self,
        phone: &str,
        template: &MessageTemplate,
        variables: &serde_json::Value,
    ) {
        self.guard.release(phone, &template.body, variables);
    }

    /// Deliver one message, retrying per the policy.
    pub async fn send(
        &self,
        phone: &str,
        template: &MessageTemplate,
        variables: &serde_json::Value,
        auth: &AuthContext,
    ) -> SendResult {
        // Reserving up front makes the duplicate check race-free: of two
        // identical concurrent sends only one reaches the provider.
        if !self.guard.try_reserve(phone, &template.body, variables) {
            debug!(phone = %phone, "send suppressed as duplicate");
            return SendResult::Skipped {
                reason: SkipReason::DuplicateMessage,
                attempts: 0,
            };
        }

        let mut attempts: u32 = 0;
        let mut last_error: Option<(String, ErrorCategory, Option<RateLimitInfo>)> = None;

        while attempts < self.policy.max_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.policy.backoff_delay(attempts)).await;
            }

            let text = template.render(variables);
            let attempt_timeout = progressive_timeout(attempts + 1);
            attempts += 1;

            match timeout(attempt_timeout, self.provider.send(phone, &text, auth)).await {
                Ok(Ok(response)) => {
                    self.guard.record(phone, &template.body, variables);
                    debug!(
                        phone = %phone,
                        provider_message_id = %response.provider_message_id,
                        attempts = attempts,
                        "message sent"
                    );
                    return SendResult::Success {
                        provider_message_id: response.provider_message_id,
                        timestamp: response.accepted_at,
                        attempts,
                    };
                }
                Ok(Err(err)) => {
                    let category = classify(&err);
                    let rate_limit = err.rate_limit_info().cloned();
                    warn!(
                        phone = %phone,
                        attempt = attempts,
                        category = %category,
                        error = %err,
                        "send attempt failed"
                    );
                    let retryable = category.is_retryable();
                    let rate_limited = category == ErrorCategory::RateLimit;
                    last_error = Some((err.to_string(), category, rate_limit));

                    if !retryable {
                        break;
                    }
                    if rate_limited && attempts < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.rate_limit_cooldown()).await;
                    }
                }
                Err(_) => {
                    let secs = attempt_timeout.as_secs();
                    warn!(
                        phone = %phone,
                        attempt = attempts,
                        timeout_secs = secs,
                        "send attempt timed out"
                    );
                    last_error = Some((
                        format!("provider call timed out after {secs}s"),
                        ErrorCategory::Timeout(secs),
                        None,
                    ));
                }
            }
        }

        self.guard.release(phone, &template.body, variables);

        let (error, category, rate_limit) = last_error.unwrap_or_else(|| {
            (
                "no send attempts were made".to_string(),
                ErrorCategory::Unknown,
                None,
            )
        });

        // Retries being the limiting factor is reported as max_retries; a
        // permanent error keeps its own category.
        let (final_category, underlying) =
            if attempts >= self.policy.max_attempts && category.is_retryable() {
                (ErrorCategory::MaxRetries, Some(category))
            } else {
                (category, None)
            };

        SendResult::Failed {
            error,
            category: final_category,
            underlying,
            rate_limit,
            attempts,
        }
    }
}
