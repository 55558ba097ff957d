//! Priority-tier pacing between consecutive message dispatches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::RateLimitSettings;

/// Batch dispatch priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {s}")),
        }
    }
}

/// Pure lookup from priority tier to minimum inter-send delay.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    high: Duration,
    normal: Duration,
    low: Duration,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            high: Duration::from_millis(settings.high_ms),
            normal: Duration::from_millis(settings.normal_ms),
            low: Duration::from_millis(settings.low_ms),
        }
    }

    /// Minimum delay between dispatches for the tier.
    pub fn delay_for(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    /// Delay for a tier named by string; unknown tiers fall back to normal.
    pub fn delay_for_tier(&self, tier: &str) -> Duration {
        self.delay_for(tier.parse().unwrap_or_default())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_delays() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.delay_for(Priority::High), Duration::from_millis(125));
        assert_eq!(
            limiter.delay_for(Priority::Normal),
            Duration::from_millis(200)
        );
        assert_eq!(limiter.delay_for(Priority::Low), Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_tier_defaults_to_normal() {
        let limiter = RateLimiter::default();
        assert_eq!(
            limiter.delay_for_tier("mystery"),
            limiter.delay_for(Priority::Normal)
        );
        assert_eq!(
            limiter.delay_for_tier("low"),
            limiter.delay_for(Priority::Low)
        );
    }
}
