//! Quota gate — per-tier periodic admission.
//!
//! Limits (per 30-day window, -1 = unbounded):
//!
//!   tier      compile  deploy  function_test
//!   free      -1       5       2
//!   tier_mid  -1       -1      5
//!   tier_top  -1       -1      -1
//!
//! `admit` never increments; increments happen only on terminal deploy
//! success through the audit hooks, so failed attempts do not burn quota.

use chrono::{DateTime, Utc};

use crucible_core::JobError;
use crucible_core::user::{QuotaAction, Tier, UsageCounter, UserRef};

use crate::directory::Directory;

/// Per-tier limit for an action.
pub fn tier_limit(tier: Tier, action: QuotaAction) -> i64 {
    match (tier, action) {
        (_, QuotaAction::Compile) => -1,
        (Tier::Free, QuotaAction::Deploy) => 5,
        (Tier::Free, QuotaAction::FunctionTest) => 2,
        (Tier::TierMid, QuotaAction::Deploy) => -1,
        (Tier::TierMid, QuotaAction::FunctionTest) => 5,
        (Tier::TierTop, _) => -1,
    }
}

/// Outcome of a pure admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted. `reset` marks that the 30-day window had expired and the
    /// counter should be zeroed in the directory.
    Admit { reset: bool },
    Reject { current: i64, limit: i64 },
}

fn counter_for(user: &UserRef, action: QuotaAction) -> Option<&UsageCounter> {
    match action {
        QuotaAction::Deploy => Some(&user.deploy_counter),
        QuotaAction::FunctionTest => Some(&user.function_test_counter),
        QuotaAction::Compile => None,
    }
}

/// Pure admission decision against a user snapshot. The periodic reset
/// is observed here and persisted by the caller.
pub fn evaluate(user: &UserRef, action: QuotaAction, now: DateTime<Utc>) -> Admission {
    let limit = tier_limit(user.tier, action);
    if limit == -1 {
        return Admission::Admit { reset: false };
    }
    let Some(counter) = counter_for(user, action) else {
        return Admission::Admit { reset: false };
    };
    if counter.period_expired(now) {
        // Window rolled over: the effective count is zero.
        return Admission::Admit { reset: true };
    }
    if counter.count < limit {
        Admission::Admit { reset: false }
    } else {
        Admission::Reject {
            current: counter.count,
            limit,
        }
    }
}

/// Directory-backed gate used at ingress.
#[derive(Clone)]
pub struct QuotaGate {
    directory: Directory,
}

impl QuotaGate {
    pub fn new(directory: Directory) -> Self {
        Self { directory }
    }

    /// Admit or reject; persists a lazy window reset when one is due.
    pub async fn admit(&self, user: &UserRef, action: QuotaAction) -> Result<(), JobError> {
        match evaluate(user, action, Utc::now()) {
            Admission::Admit { reset } => {
                if reset {
                    self.directory.reset_counter(&user.id, action).await?;
                }
                Ok(())
            }
            Admission::Reject { current, limit } => Err(JobError::QuotaExceeded { current, limit }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(tier: Tier, deploys: i64, ft: i64) -> UserRef {
        UserRef {
            id: "u1".into(),
            tier,
            deploy_counter: UsageCounter {
                count: deploys,
                limit: tier_limit(tier, QuotaAction::Deploy),
                reset_at: Utc::now(),
            },
            function_test_counter: UsageCounter {
                count: ft,
                limit: tier_limit(tier, QuotaAction::FunctionTest),
                reset_at: Utc::now(),
            },
        }
    }

    #[test]
    fn compile_is_unbounded_for_every_tier() {
        for tier in [Tier::Free, Tier::TierMid, Tier::TierTop] {
            assert_eq!(
                evaluate(&user(tier, 1_000_000, 0), QuotaAction::Compile, Utc::now()),
                Admission::Admit { reset: false }
            );
        }
    }

    #[test]
    fn free_tier_deploy_limit_is_five() {
        let now = Utc::now();
        assert_eq!(
            evaluate(&user(Tier::Free, 4, 0), QuotaAction::Deploy, now),
            Admission::Admit { reset: false }
        );
        assert_eq!(
            evaluate(&user(Tier::Free, 5, 0), QuotaAction::Deploy, now),
            Admission::Reject {
                current: 5,
                limit: 5
            }
        );
    }

    #[test]
    fn free_tier_function_test_limit_is_two() {
        let now = Utc::now();
        assert_eq!(
            evaluate(&user(Tier::Free, 0, 2), QuotaAction::FunctionTest, now),
            Admission::Reject {
                current: 2,
                limit: 2
            }
        );
    }

    #[test]
    fn mid_tier_deploys_unbounded_function_tests_capped() {
        let now = Utc::now();
        assert_eq!(
            evaluate(&user(Tier::TierMid, 9_999, 0), QuotaAction::Deploy, now),
            Admission::Admit { reset: false }
        );
        assert_eq!(
            evaluate(&user(Tier::TierMid, 0, 5), QuotaAction::FunctionTest, now),
            Admission::Reject {
                current: 5,
                limit: 5
            }
        );
    }

    #[test]
    fn top_tier_never_rejects() {
        let now = Utc::now();
        assert_eq!(
            evaluate(&user(Tier::TierTop, 9_999, 9_999), QuotaAction::Deploy, now),
            Admission::Admit { reset: false }
        );
        assert_eq!(
            evaluate(
                &user(Tier::TierTop, 9_999, 9_999),
                QuotaAction::FunctionTest,
                now
            ),
            Admission::Admit { reset: false }
        );
    }

    #[test]
    fn expired_window_admits_with_reset() {
        let mut u = user(Tier::Free, 5, 0);
        u.deploy_counter.reset_at = Utc::now() - chrono::Duration::days(31);
        assert_eq!(
            evaluate(&u, QuotaAction::Deploy, Utc::now()),
            Admission::Admit { reset: true }
        );
    }

    #[test]
    fn window_at_twenty_nine_days_still_counts() {
        let mut u = user(Tier::Free, 5, 0);
        u.deploy_counter.reset_at = Utc::now() - chrono::Duration::days(29);
        assert_eq!(
            evaluate(&u, QuotaAction::Deploy, Utc::now()),
            Admission::Reject {
                current: 5,
                limit: 5
            }
        );
    }

    #[tokio::test]
    async fn gate_persists_lazy_reset() {
        use crate::job_store::open_store_in_memory;

        let dir = Directory::new(open_store_in_memory().await.unwrap());
        dir.upsert_user("u1", "tok", Tier::Free).await.unwrap();
        for _ in 0..5 {
            dir.increment_deploy_count("u1").await.unwrap();
        }
        let gate = QuotaGate::new(dir.clone());

        let full = dir.get_user("u1").await.unwrap().unwrap();
        let err = gate.admit(&full, QuotaAction::Deploy).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::QuotaExceeded {
                current: 5,
                limit: 5
            }
        ));

        // Pretend the window expired: evaluate sees it and the gate
        // zeroes the stored counter.
        let mut stale = full.clone();
        stale.deploy_counter.reset_at = Utc::now() - chrono::Duration::days(31);
        gate.admit(&stale, QuotaAction::Deploy).await.unwrap();
        let fresh = dir.get_user("u1").await.unwrap().unwrap();
        assert_eq!(fresh.deploy_counter.count, 0);
    }
}
