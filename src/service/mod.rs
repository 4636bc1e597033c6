//! Referral orchestration.
//!
//! [`ReferralService`] ties the referral store, reward lock, user directory
//! and settings together. Registration lives in `register`, reward
//! distribution in `distribute`, and the read side in `query`.

mod distribute;
mod query;
mod register;

#[cfg(test)]
mod tests;

use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::ReferralError;
use crate::ledger::{RewardAuditLog, SqliteRewardAuditLog, SqliteUserDirectory, UserDirectory};
use crate::lock::{MemoryRewardLock, RewardLock};
use crate::policy::Operation;
use crate::referrals::{ReferralStore, SqliteReferralStore};
use crate::settings::{
    ReferralSettings, SettingsStore, SqliteSettingsStore, KEY_REFERRAL_ENABLED, REFERRAL_KEYS,
};
use crate::store::{Database, Scope};
use crate::subscription::{SqliteSubscriptionService, SubscriptionAssigner};

pub use distribute::RewardOutcome;
pub use query::{random_referral_code, referral_link, REFERRAL_CODE_ATTEMPTS};
pub use register::Registration;

pub type SettingsCallback = Box<dyn Fn() + Send + Sync>;

pub struct ReferralService {
    referrals: Arc<dyn ReferralStore>,
    lock: Arc<dyn RewardLock>,
    users: Arc<dyn UserDirectory>,
    settings: Arc<dyn SettingsStore>,
    subscriptions: Option<Arc<dyn SubscriptionAssigner>>,
    audit: Option<Arc<dyn RewardAuditLog>>,
    on_settings_updated: RwLock<Option<SettingsCallback>>,
}

impl ReferralService {
    pub fn new(
        referrals: Arc<dyn ReferralStore>,
        lock: Arc<dyn RewardLock>,
        users: Arc<dyn UserDirectory>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            referrals,
            lock,
            users,
            settings,
            subscriptions: None,
            audit: None,
            on_settings_updated: RwLock::new(None),
        }
    }

    /// Every backend on one SQLite database, with an in-process reward lock.
    pub fn sqlite(db: &Database) -> Self {
        Self::new(
            Arc::new(SqliteReferralStore::new(db.clone())),
            Arc::new(MemoryRewardLock::new()),
            Arc::new(SqliteUserDirectory::new(db.clone())),
            Arc::new(SqliteSettingsStore::new(db.clone())),
        )
        .with_subscriptions(Arc::new(SqliteSubscriptionService::new(db.clone())))
        .with_audit_log(Arc::new(SqliteRewardAuditLog::new(db.clone())))
    }

    pub fn with_subscriptions(mut self, subscriptions: Arc<dyn SubscriptionAssigner>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn RewardAuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Called after every successful settings update.
    pub fn set_on_settings_updated(&self, callback: impl Fn() + Send + Sync + 'static) {
        match self.on_settings_updated.write() {
            Ok(mut slot) => *slot = Some(Box::new(callback)),
            Err(_) => warn!("settings callback slot poisoned, callback not installed"),
        }
    }

    /// `false` when the flag is missing or cannot be read.
    pub fn is_referral_enabled(&self, scope: &Scope<'_>) -> bool {
        match self.settings.get_value(scope, KEY_REFERRAL_ENABLED) {
            Ok(value) => value.trim() == "true",
            Err(err) if err.is_not_found() => false,
            Err(err) => {
                Operation::ReadSettings.report(&err, KEY_REFERRAL_ENABLED);
                false
            }
        }
    }

    /// Current settings; a read failure yields the all-disabled default.
    pub fn get_referral_settings(&self, scope: &Scope<'_>) -> ReferralSettings {
        let values = self.settings.get_multiple(scope, &REFERRAL_KEYS);
        match Operation::ReadSettings.absorb(values, "referral settings") {
            Ok(Some(values)) => ReferralSettings::from_values(&values),
            Ok(None) | Err(_) => ReferralSettings::default(),
        }
    }

    pub fn update_referral_settings(
        &self,
        scope: &Scope<'_>,
        settings: &ReferralSettings,
    ) -> Result<(), ReferralError> {
        settings.validate()?;
        let written = self.settings.set_multiple(scope, &settings.to_values());
        Operation::UpdateSettings.absorb(written, "referral settings")?;
        info!(
            enabled = settings.enabled,
            max_per_user = settings.max_per_user,
            "referral settings updated"
        );
        if let Ok(slot) = self.on_settings_updated.read() {
            if let Some(callback) = slot.as_ref() {
                callback();
            }
        }
        Ok(())
    }
}

/// `ab***@example.com`; a one- or two-character local part keeps a single
/// character. `***` when there is no local part.
pub fn mask_email(email: &str) -> String {
    let at = match email.find('@') {
        Some(at) if at > 0 => at,
        _ => return "***".to_string(),
    };
    let (local, domain) = email.split_at(at);
    let keep = if local.chars().count() <= 2 { 1 } else { 2 };
    let prefix: String = local.chars().take(keep).collect();
    format!("{prefix}***{domain}")
}
