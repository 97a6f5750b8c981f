//! User and project references — consumed by the core, owned elsewhere.
//!
//! Identity, tier, and usage counters belong to the account system; the
//! orchestrator only reads them at admission time and increments the
//! deploy counter on terminal success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::SourceFile;

/// Subscription tier. Limits per tier live in the quota gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    TierMid,
    TierTop,
}

/// Periodic usage counter. `limit = -1` means unbounded. The window is
/// 30 days from `reset_at`, reset lazily on the next check after expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub count: i64,
    pub limit: i64,
    pub reset_at: DateTime<Utc>,
}

impl UsageCounter {
    pub const PERIOD_DAYS: i64 = 30;

    pub fn new(limit: i64) -> Self {
        Self {
            count: 0,
            limit,
            reset_at: Utc::now(),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.limit == -1
    }

    /// True once the 30-day window has elapsed.
    pub fn period_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.reset_at >= chrono::Duration::days(Self::PERIOD_DAYS)
    }
}

/// Read-only view of a user at admission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub tier: Tier,
    pub deploy_counter: UsageCounter,
    pub function_test_counter: UsageCounter,
}

/// Action classes the quota gate admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaAction {
    Compile,
    Deploy,
    FunctionTest,
}

/// Read-only view of a project and its source bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    pub owner_id: String,
    pub files: Vec<SourceFile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_counter() {
        let c = UsageCounter::new(-1);
        assert!(c.is_unbounded());
        assert!(!UsageCounter::new(5).is_unbounded());
    }

    #[test]
    fn period_expiry_at_thirty_days() {
        let c = UsageCounter {
            count: 3,
            limit: 5,
            reset_at: Utc::now() - chrono::Duration::days(29),
        };
        assert!(!c.period_expired(Utc::now()));

        let c = UsageCounter {
            reset_at: Utc::now() - chrono::Duration::days(30),
            ..c
        };
        assert!(c.period_expired(Utc::now()));
    }

    #[test]
    fn tier_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Tier::TierMid).unwrap(), "\"tier_mid\"");
        assert_eq!(serde_json::to_string(&Tier::Free).unwrap(), "\"free\"");
    }
}
