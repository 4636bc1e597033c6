use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ReferralError;
use crate::model::{GroupId, RewardSnapshot, RewardTerms};
use crate::store::{Database, Scope};

pub const KEY_REFERRAL_ENABLED: &str = "referral_enabled";
pub const KEY_REFERRER_BALANCE_REWARD: &str = "referral_referrer_balance_reward";
pub const KEY_REFERRER_GROUP_ID: &str = "referral_referrer_group_id";
pub const KEY_REFERRER_SUBSCRIPTION_DAYS: &str = "referral_referrer_subscription_days";
pub const KEY_REFEREE_BALANCE_REWARD: &str = "referral_referee_balance_reward";
pub const KEY_REFEREE_GROUP_ID: &str = "referral_referee_group_id";
pub const KEY_REFEREE_SUBSCRIPTION_DAYS: &str = "referral_referee_subscription_days";
pub const KEY_MAX_PER_USER: &str = "referral_max_per_user";
pub const KEY_API_BASE_URL: &str = "api_base_url";

/// Fractional digits amounts are written with.
pub const AMOUNT_SCALE: u32 = 8;

pub const REFERRAL_KEYS: [&str; 8] = [
    KEY_REFERRAL_ENABLED,
    KEY_REFERRER_BALANCE_REWARD,
    KEY_REFERRER_GROUP_ID,
    KEY_REFERRER_SUBSCRIPTION_DAYS,
    KEY_REFEREE_BALANCE_REWARD,
    KEY_REFEREE_GROUP_ID,
    KEY_REFEREE_SUBSCRIPTION_DAYS,
    KEY_MAX_PER_USER,
];

/// Key/value configuration source.
pub trait SettingsStore: Send + Sync {
    /// `NotFound("setting")` when the key is absent.
    fn get_value(&self, scope: &Scope<'_>, key: &str) -> Result<String, ReferralError>;

    /// Missing keys are simply left out of the result.
    fn get_multiple(
        &self,
        scope: &Scope<'_>,
        keys: &[&str],
    ) -> Result<BTreeMap<String, String>, ReferralError>;

    fn set_multiple(
        &self,
        scope: &Scope<'_>,
        values: &BTreeMap<String, String>,
    ) -> Result<(), ReferralError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReferralSettings {
    pub enabled: bool,
    pub referrer_balance_reward: Decimal,
    pub referrer_group_id: Option<GroupId>,
    pub referrer_subscription_days: u32,
    pub referee_balance_reward: Decimal,
    pub referee_group_id: Option<GroupId>,
    pub referee_subscription_days: u32,
    /// 0 means unlimited.
    pub max_per_user: u32,
}

impl ReferralSettings {
    /// Decode from raw setting values. Anything missing or unparsable falls
    /// back to zero / disabled.
    pub fn from_values(values: &BTreeMap<String, String>) -> Self {
        let raw = |key: &str| values.get(key).map(|v| v.trim()).unwrap_or("");
        let amount = |key: &str| raw(key).parse::<Decimal>().unwrap_or(Decimal::ZERO);
        let count = |key: &str| raw(key).parse::<u32>().unwrap_or(0);
        let group = |key: &str| raw(key).parse::<GroupId>().ok().filter(|id| *id > 0);
        Self {
            enabled: raw(KEY_REFERRAL_ENABLED) == "true",
            referrer_balance_reward: amount(KEY_REFERRER_BALANCE_REWARD),
            referrer_group_id: group(KEY_REFERRER_GROUP_ID),
            referrer_subscription_days: count(KEY_REFERRER_SUBSCRIPTION_DAYS),
            referee_balance_reward: amount(KEY_REFEREE_BALANCE_REWARD),
            referee_group_id: group(KEY_REFEREE_GROUP_ID),
            referee_subscription_days: count(KEY_REFEREE_SUBSCRIPTION_DAYS),
            max_per_user: count(KEY_MAX_PER_USER),
        }
    }

    pub fn to_values(&self) -> BTreeMap<String, String> {
        let amount = |d: Decimal| format!("{:.*}", AMOUNT_SCALE as usize, d.round_dp(AMOUNT_SCALE));
        let group = |g: Option<GroupId>| g.unwrap_or(0).to_string();
        [
            (KEY_REFERRAL_ENABLED, self.enabled.to_string()),
            (KEY_REFERRER_BALANCE_REWARD, amount(self.referrer_balance_reward)),
            (KEY_REFERRER_GROUP_ID, group(self.referrer_group_id)),
            (KEY_REFERRER_SUBSCRIPTION_DAYS, self.referrer_subscription_days.to_string()),
            (KEY_REFEREE_BALANCE_REWARD, amount(self.referee_balance_reward)),
            (KEY_REFEREE_GROUP_ID, group(self.referee_group_id)),
            (KEY_REFEREE_SUBSCRIPTION_DAYS, self.referee_subscription_days.to_string()),
            (KEY_MAX_PER_USER, self.max_per_user.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub fn validate(&self) -> Result<(), ReferralError> {
        if self.referrer_balance_reward < Decimal::ZERO {
            return Err(ReferralError::InvalidSettings(
                "referrer balance reward must not be negative".into(),
            ));
        }
        if self.referee_balance_reward < Decimal::ZERO {
            return Err(ReferralError::InvalidSettings(
                "referee balance reward must not be negative".into(),
            ));
        }
        for group in [self.referrer_group_id, self.referee_group_id].into_iter().flatten() {
            if group <= 0 {
                return Err(ReferralError::InvalidSettings(format!(
                    "group id {group} must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Freeze the reward part of these settings.
    pub fn snapshot(&self) -> RewardSnapshot {
        RewardSnapshot {
            referrer: RewardTerms {
                balance: self.referrer_balance_reward,
                group_id: self.referrer_group_id,
                subscription_days: self.referrer_subscription_days,
            },
            referee: RewardTerms {
                balance: self.referee_balance_reward,
                group_id: self.referee_group_id,
                subscription_days: self.referee_subscription_days,
            },
        }
    }
}

pub struct SqliteSettingsStore {
    db: Database,
}

impl SqliteSettingsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get_value(&self, scope: &Scope<'_>, key: &str) -> Result<String, ReferralError> {
        self.db.with_conn(scope, |conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or(ReferralError::NotFound("setting"))
        })
    }

    fn get_multiple(
        &self,
        scope: &Scope<'_>,
        keys: &[&str],
    ) -> Result<BTreeMap<String, String>, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let mut stmt = conn.prepare_cached("SELECT value FROM settings WHERE key = ?1")?;
            let mut out = BTreeMap::new();
            for key in keys {
                let value = stmt
                    .query_row(params![key], |row| row.get::<_, String>(0))
                    .optional()?;
                if let Some(value) = value {
                    out.insert((*key).to_string(), value);
                }
            }
            Ok(out)
        })
    }

    fn set_multiple(
        &self,
        scope: &Scope<'_>,
        values: &BTreeMap<String, String>,
    ) -> Result<(), ReferralError> {
        let now = Utc::now();
        self.db.run_in_tx(scope, |tx| {
            self.db.with_conn(tx, |conn| {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                )?;
                for (key, value) in values {
                    stmt.execute(params![key, value, now])?;
                }
                Ok(())
            })
        })
    }
}
