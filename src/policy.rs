//! Error disposition table.
//!
//! Several referral flows turn failures into logged no-ops on purpose
//! (signup must never fail because of a bad code, a subscription grant is
//! best-effort). Instead of ad hoc matches at each call site, every
//! absorbing site routes its failure through [`Operation::absorb`], which
//! consults the table below.

use tracing::{error, warn};

use crate::error::ReferralError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the error back to the caller.
    Propagate,
    /// Log it and carry on as if the step succeeded.
    LogAndContinue,
    /// Log it and stop the current attempt.
    LogAndAbort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    RegisterReferral,
    ReadSettings,
    LockAcquire,
    LockRelease,
    BalanceCredit,
    SubscriptionGrant,
    AuditRecord,
    PersistReward,
    UpdateSettings,
}

impl Operation {
    pub const fn disposition(self) -> Disposition {
        match self {
            Operation::RegisterReferral => Disposition::LogAndContinue,
            Operation::ReadSettings => Disposition::LogAndContinue,
            Operation::LockAcquire => Disposition::LogAndAbort,
            Operation::LockRelease => Disposition::LogAndContinue,
            Operation::BalanceCredit => Disposition::LogAndAbort,
            Operation::SubscriptionGrant => Disposition::LogAndContinue,
            Operation::AuditRecord => Disposition::LogAndContinue,
            Operation::PersistReward => Disposition::LogAndAbort,
            Operation::UpdateSettings => Disposition::Propagate,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::RegisterReferral => "register_referral",
            Operation::ReadSettings => "read_settings",
            Operation::LockAcquire => "lock_acquire",
            Operation::LockRelease => "lock_release",
            Operation::BalanceCredit => "balance_credit",
            Operation::SubscriptionGrant => "subscription_grant",
            Operation::AuditRecord => "audit_record",
            Operation::PersistReward => "persist_reward",
            Operation::UpdateSettings => "update_settings",
        }
    }

    /// Log `err` the way this operation's disposition asks for. Propagated
    /// errors are left to the caller to report.
    pub fn report(self, err: &ReferralError, context: &str) {
        match self.disposition() {
            Disposition::Propagate => {}
            Disposition::LogAndContinue => {
                warn!(operation = self.name(), context, error = %err, "referral step failed, continuing");
            }
            Disposition::LogAndAbort => {
                error!(operation = self.name(), context, error = %err, "referral step failed, aborting attempt");
            }
        }
    }

    /// Apply this operation's disposition to `result`.
    ///
    /// `Ok(Some(v))` is a success, `Ok(None)` means the failure was logged
    /// and swallowed, `Err` means the caller must stop.
    pub fn absorb<T>(
        self,
        result: Result<T, ReferralError>,
        context: &str,
    ) -> Result<Option<T>, ReferralError> {
        let err = match result {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };
        self.report(&err, context);
        match self.disposition() {
            Disposition::LogAndContinue => Ok(None),
            Disposition::Propagate | Disposition::LogAndAbort => Err(err),
        }
    }
}
