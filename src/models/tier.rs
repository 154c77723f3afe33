use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Provider service plan. Resolved once at submission into concrete limits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceTier {
    #[default]
    Free,
    Paid,
}

/// Rate and concurrency ceilings that come together with a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub max_concurrency: usize,
    pub max_rate_per_minute: u32,
}

impl ServiceTier {
    pub fn limits(self) -> TierLimits {
        match self {
            ServiceTier::Free => TierLimits {
                max_concurrency: 2,
                max_rate_per_minute: 10,
            },
            ServiceTier::Paid => TierLimits {
                max_concurrency: 10,
                max_rate_per_minute: 500,
            },
        }
    }
}

impl TierLimits {
    /// Clamp a requested concurrency into `[1, max_concurrency]`. Missing means max.
    pub fn clamp_concurrency(&self, requested: Option<i64>) -> usize {
        match requested {
            None => self.max_concurrency,
            Some(n) if n < 1 => 1,
            Some(n) => (n as u64).min(self.max_concurrency as u64) as usize,
        }
    }

    /// Clamp a requested per-minute rate into `[1, max_rate_per_minute]`. Missing means max.
    pub fn clamp_rate(&self, requested: Option<i64>) -> u32 {
        match requested {
            None => self.max_rate_per_minute,
            Some(n) if n < 1 => 1,
            Some(n) => (n as u64).min(self.max_rate_per_minute as u64) as u32,
        }
    }
}
