use tracing::{debug, info};

use super::ReferralService;
use crate::error::ReferralError;
use crate::model::{ReferralRelationship, UserId};
use crate::policy::Operation;
use crate::store::Scope;

/// What a signup-time registration did. Never an error for the caller.
#[derive(Debug)]
pub enum Registration {
    /// No referral code was supplied.
    NoCode,
    Recorded(ReferralRelationship),
    /// The code was ignored; the reason has already been logged.
    Skipped(ReferralError),
}

impl Registration {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Registration::Recorded(_))
    }
}

impl ReferralService {
    /// Record that `referee_id` signed up with `code`. First referral wins;
    /// every failure is logged and swallowed so signup always goes through.
    pub fn register_referral(
        &self,
        scope: &Scope<'_>,
        code: &str,
        referee_id: UserId,
    ) -> Registration {
        let code = code.trim();
        if code.is_empty() {
            return Registration::NoCode;
        }
        match self.try_register(scope, code, referee_id) {
            Ok(rel) => {
                info!(
                    referral_id = rel.id,
                    referrer_id = rel.referrer_id,
                    referee_id,
                    "referral recorded"
                );
                Registration::Recorded(rel)
            }
            Err(ReferralError::Disabled) => {
                debug!(referee_id, "referral disabled, code ignored");
                Registration::Skipped(ReferralError::Disabled)
            }
            Err(err) => {
                Operation::RegisterReferral.report(&err, &format!("referee {referee_id}"));
                Registration::Skipped(err)
            }
        }
    }

    fn try_register(
        &self,
        scope: &Scope<'_>,
        code: &str,
        referee_id: UserId,
    ) -> Result<ReferralRelationship, ReferralError> {
        if !self.is_referral_enabled(scope) {
            return Err(ReferralError::Disabled);
        }
        let referrer = self
            .users
            .get_by_referral_code(scope, code)
            .map_err(|err| match err {
                ReferralError::NotFound(_) => ReferralError::InvalidCode,
                other => other,
            })?;
        if referrer.id == referee_id {
            return Err(ReferralError::SelfReferral);
        }
        match self.referrals.get_by_referee(scope, referee_id) {
            Ok(_) => return Err(ReferralError::AlreadyExists),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let limit = self.get_referral_settings(scope).max_per_user;
        if limit > 0 && self.referrals.count_by_referrer(scope, referrer.id)? >= u64::from(limit) {
            return Err(ReferralError::MaxReached { limit });
        }
        self.referrals.create(scope, referrer.id, referee_id)
    }
}
