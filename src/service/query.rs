use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info};

use super::{mask_email, ReferralService};
use crate::error::ReferralError;
use crate::model::{
    Page, PageRequest, ReferralEntry, ReferralInfo, ReferralStats, ReferralStatus, UserId,
};
use crate::policy::Operation;
use crate::settings::KEY_API_BASE_URL;
use crate::store::Scope;

pub const REFERRAL_CODE_ATTEMPTS: u32 = 10;

/// Eight URL-safe characters from six random bytes.
pub fn random_referral_code() -> String {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Signup link for `code`, or empty when no base URL is configured.
pub fn referral_link(base_url: &str, code: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return String::new();
    }
    format!("{base}/register?ref={code}")
}

impl ReferralService {
    /// The user's referral code, generating and storing one on first use.
    pub fn generate_referral_code(
        &self,
        scope: &Scope<'_>,
        user_id: UserId,
    ) -> Result<String, ReferralError> {
        let mut user = self.users.get_by_id(scope, user_id)?;
        if !user.referral_code.is_empty() {
            return Ok(user.referral_code);
        }
        for attempt in 1..=REFERRAL_CODE_ATTEMPTS {
            user.referral_code = random_referral_code();
            match self.users.update(scope, &user) {
                Ok(()) => {
                    info!(user_id, "referral code generated");
                    return Ok(user.referral_code);
                }
                Err(ReferralError::AlreadyExists) => {
                    debug!(user_id, attempt, "referral code collision, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ReferralError::CodeExhausted {
            attempts: REFERRAL_CODE_ATTEMPTS,
        })
    }

    pub fn get_referral_info(
        &self,
        scope: &Scope<'_>,
        user_id: UserId,
    ) -> Result<ReferralInfo, ReferralError> {
        let referral_code = self.generate_referral_code(scope, user_id)?;

        let total_count = self.referrals.count_by_referrer(scope, user_id)?;
        let rewarded_count =
            self.referrals
                .count_by_referrer_and_status(scope, user_id, ReferralStatus::Rewarded)?;
        let total_balance_earned = self.referrals.sum_referrer_balance_reward(scope, user_id)?;

        let base_url = match self.settings.get_value(scope, KEY_API_BASE_URL) {
            Ok(url) => url,
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => {
                Operation::ReadSettings.report(&err, KEY_API_BASE_URL);
                String::new()
            }
        };

        Ok(ReferralInfo {
            referral_link: referral_link(&base_url, &referral_code),
            referral_code,
            stats: ReferralStats {
                total_count,
                rewarded_count,
                pending_count: total_count.saturating_sub(rewarded_count),
                total_balance_earned,
            },
        })
    }

    /// The user's own referrals, newest first, with masked referee emails.
    pub fn get_referral_history(
        &self,
        scope: &Scope<'_>,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<ReferralEntry>, ReferralError> {
        let listed = self.referrals.list_by_referrer(scope, user_id, page)?;
        Ok(listed.map(|relationship| {
            let referee_email = self
                .users
                .get_by_id(scope, relationship.referee_id)
                .ok()
                .map(|user| mask_email(&user.email));
            ReferralEntry {
                relationship,
                referrer_email: None,
                referee_email,
            }
        }))
    }

    /// Every referral, newest first, with both emails unmasked.
    pub fn get_all_referrals(
        &self,
        scope: &Scope<'_>,
        page: PageRequest,
    ) -> Result<Page<ReferralEntry>, ReferralError> {
        let listed = self.referrals.list_all(scope, page)?;
        Ok(listed.map(|relationship| {
            let email = |id| self.users.get_by_id(scope, id).ok().map(|user| user.email);
            ReferralEntry {
                referrer_email: email(relationship.referrer_id),
                referee_email: email(relationship.referee_id),
                relationship,
            }
        }))
    }
}
