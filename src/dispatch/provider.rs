//! # Message Provider Interface
//!
//! The external send operation, treated as an opaque contract: one call per
//! recipient with the rendered text and an auth context, returning a provider
//! message id on success or a typed failure carrying an HTTP status or a
//! connection error, optionally with rate-limit headers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rate-limit response headers, captured verbatim when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: Option<String>,
    pub remaining: Option<String>,
    pub reset: Option<String>,
}

/// Per-batch credentials for the provider, held in memory only.
#[derive(Clone)]
pub struct AuthContext {
    pub account_id: String,
    pub api_token: String,
}

impl AuthContext {
    pub fn new(account_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            api_token: api_token.into(),
        }
    }
}

// Token is redacted from logs.
impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("account_id", &self.account_id)
            .field("api_token", &"[redacted]")
            .finish()
    }
}

/// Successful provider acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Typed provider failure.
///
/// Client-side timeouts are not represented here: the sender enforces its own
/// progressive timeout around the call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}")]
    Http {
        status: u16,
        body: Option<String>,
        rate_limit: Option<RateLimitInfo>,
    },

    #[error("connection to provider failed: {0}")]
    Connection(String),
}

impl ProviderError {
    /// Rate-limit headers attached to the failure, if any.
    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        match self {
            Self::Http { rate_limit, .. } => rate_limit.as_ref(),
            Self::Connection(_) => None,
        }
    }
}

/// External messaging provider consumed by the sender.
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Send one rendered message to one recipient.
    async fn send(
        &self,
        phone: &str,
        text: &str,
        auth: &AuthContext,
    ) -> Result<ProviderResponse, ProviderError>;
}
