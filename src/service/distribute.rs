use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::ReferralService;
use crate::error::ReferralError;
use crate::ledger::RewardRecord;
use crate::lock::RewardLockGuard;
use crate::model::{ReferralId, ReferralStatus, RewardSnapshot, UserId};
use crate::policy::Operation;
use crate::rewards::{RewardGrant, RewardPlan};
use crate::store::Scope;
use crate::subscription::AssignSubscription;

/// How a trigger ended. Informational only: triggering never fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RewardOutcome {
    Disabled,
    NoRelationship,
    AlreadyRewarded,
    /// Another attempt holds the reward lock for this referee.
    LockContended,
    Rewarded {
        referral_id: ReferralId,
        snapshot: RewardSnapshot,
    },
    /// Nothing was marked rewarded; a later trigger may retry.
    Aborted { reason: String },
}

impl RewardOutcome {
    pub fn is_rewarded(&self) -> bool {
        matches!(self, RewardOutcome::Rewarded { .. })
    }
}

impl ReferralService {
    /// Reward the referrer and referee once the referee qualifies (first
    /// top-up). Safe to call repeatedly and concurrently: at most one call
    /// per referee ever credits anything.
    ///
    /// When `scope` carries a transaction, every write joins it.
    pub fn trigger_referral_reward(&self, scope: &Scope<'_>, referee_id: UserId) -> RewardOutcome {
        match self.distribute(scope, referee_id) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(referee_id, error = %err, "referral reward attempt aborted");
                RewardOutcome::Aborted {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn distribute(
        &self,
        scope: &Scope<'_>,
        referee_id: UserId,
    ) -> Result<RewardOutcome, ReferralError> {
        if !self.is_referral_enabled(scope) {
            return Ok(RewardOutcome::Disabled);
        }

        let rel = match self.referrals.get_by_referee(scope, referee_id) {
            Ok(rel) => rel,
            Err(err) if err.is_not_found() => return Ok(RewardOutcome::NoRelationship),
            Err(err) => return Err(err),
        };
        if rel.is_rewarded() {
            return Ok(RewardOutcome::AlreadyRewarded);
        }

        let context = format!("referee {referee_id} referral {}", rel.id);
        let acquired = RewardLockGuard::try_acquire(self.lock.as_ref(), referee_id);
        let Some(_guard) = Operation::LockAcquire.absorb(acquired, &context)?.flatten() else {
            debug!(referee_id, referral_id = rel.id, "reward lock contended, skipping");
            return Ok(RewardOutcome::LockContended);
        };

        // re-read under the lock: another holder may have finished meanwhile
        let rel = self.referrals.get_by_referee(scope, referee_id)?;
        if rel.is_rewarded() {
            return Ok(RewardOutcome::AlreadyRewarded);
        }

        let snapshot = self.get_referral_settings(scope).snapshot();
        let plan = RewardPlan::for_relationship(&rel, &snapshot);
        if plan.is_empty() {
            // an empty plan still marks the referral rewarded
            debug!(referee_id, referral_id = rel.id, "no reward configured");
        }
        debug!(
            referee_id,
            referral_id = rel.id,
            grants = plan.grants.len(),
            total_balance = %plan.total_balance(),
            "applying referral reward plan"
        );

        self.referrals.run_in_tx(scope, &mut |tx| {
            self.apply_plan(tx, &plan, &context)?;
            let persisted =
                self.referrals
                    .update_status(tx, rel.id, ReferralStatus::Rewarded, Some(&snapshot));
            Operation::PersistReward.absorb(persisted, &context)?;
            Ok(())
        })?;

        info!(
            referral_id = rel.id,
            referrer_id = rel.referrer_id,
            referee_id,
            "referral rewards distributed"
        );
        Ok(RewardOutcome::Rewarded {
            referral_id: rel.id,
            snapshot,
        })
    }

    fn apply_plan(
        &self,
        tx: &Scope<'_>,
        plan: &RewardPlan,
        context: &str,
    ) -> Result<(), ReferralError> {
        for grant in &plan.grants {
            let user_id = grant.user_id();
            let beneficiary = grant.beneficiary().as_str();
            match grant {
                RewardGrant::Balance {
                    amount,
                    audit_notes,
                    ..
                } => {
                    let credited = self.users.update_balance(tx, user_id, *amount);
                    Operation::BalanceCredit.absorb(credited, context)?;
                    debug!(user_id, beneficiary, amount = %amount, "balance credited");
                    if let Some(audit) = &self.audit {
                        let record = RewardRecord::referral_credit(user_id, *amount, audit_notes.clone());
                        Operation::AuditRecord.absorb(audit.record(tx, &record), context)?;
                    }
                }
                RewardGrant::Subscription {
                    group_id,
                    validity_days,
                    notes,
                    ..
                } => {
                    let Some(subscriptions) = &self.subscriptions else {
                        warn!(user_id, group_id, "no subscription service configured, grant skipped");
                        continue;
                    };
                    let input = AssignSubscription {
                        user_id,
                        group_id: *group_id,
                        validity_days: *validity_days,
                        assigned_by: 0,
                        notes: notes.clone(),
                    };
                    let granted = subscriptions.assign_or_extend(tx, &input);
                    if let Some((subscription, extended)) =
                        Operation::SubscriptionGrant.absorb(granted, context)?
                    {
                        debug!(
                            user_id,
                            beneficiary,
                            subscription_id = subscription.id,
                            extended,
                            "subscription granted"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
