use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::QuotaStoreError;

pub const DEFAULT_FREE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    None,
    Starter,
    Pro,
}

impl SubscriptionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Starter => "starter",
            Self::Pro => "pro",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "free" => Ok(Self::None),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            other => Err(format!("unknown subscription tier '{other}'")),
        }
    }
}

/// Usage and subscription state for one user.
///
/// `free_used <= free_limit` is deliberately not enforced here: the
/// admission check is [`QuotaRecord::can_generate_at`], and recording a
/// generation always increments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub free_used: u32,
    pub free_limit: u32,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
    #[serde(default)]
    pub subscription_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_generations: u64,
    #[serde(default)]
    pub last_generation_at: Option<DateTime<Utc>>,
}

impl QuotaRecord {
    pub fn fresh(user_id: impl Into<String>, free_limit: u32) -> Self {
        Self {
            user_id: user_id.into(),
            free_used: 0,
            free_limit: free_limit.max(1),
            subscription_tier: SubscriptionTier::None,
            subscription_expiry: None,
            total_generations: 0,
            last_generation_at: None,
        }
    }

    pub fn is_subscribed_at(&self, now: DateTime<Utc>) -> bool {
        self.subscription_tier != SubscriptionTier::None
            && self
                .subscription_expiry
                .map(|expiry| expiry > now)
                .unwrap_or(false)
    }

    pub fn can_generate_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_subscribed_at(now) {
            return true;
        }
        self.free_used < self.free_limit
    }

    pub fn can_generate(&self) -> bool {
        self.can_generate_at(Utc::now())
    }

    pub fn remaining_free(&self) -> u32 {
        self.free_limit.saturating_sub(self.free_used)
    }

    /// Counts one successful generation. Never call this for failed attempts.
    pub fn record_generation_at(&mut self, now: DateTime<Utc>) {
        self.free_used = self.free_used.saturating_add(1);
        self.total_generations = self.total_generations.saturating_add(1);
        self.last_generation_at = Some(now);
    }

    pub fn record_generation(&mut self) {
        self.record_generation_at(Utc::now());
    }

    /// Applies a billing event. `SubscriptionTier::None` clears the subscription.
    pub fn upgrade_subscription_at(
        &mut self,
        tier: SubscriptionTier,
        duration_days: u32,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaStoreError> {
        if tier == SubscriptionTier::None {
            self.subscription_tier = SubscriptionTier::None;
            self.subscription_expiry = None;
            return Ok(());
        }
        if duration_days == 0 {
            return Err(QuotaStoreError::InvalidDuration {
                user_id: self.user_id.clone(),
            });
        }
        self.subscription_tier = tier;
        self.subscription_expiry = Some(now + Duration::days(i64::from(duration_days)));
        Ok(())
    }

    pub fn upgrade_subscription(
        &mut self,
        tier: SubscriptionTier,
        duration_days: u32,
    ) -> Result<(), QuotaStoreError> {
        self.upgrade_subscription_at(tier, duration_days, Utc::now())
    }

    pub fn reset_usage(&mut self) {
        self.free_used = 0;
    }
}
