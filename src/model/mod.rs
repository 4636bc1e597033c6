use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ReferralError;

pub type UserId = i64;
pub type ReferralId = i64;
pub type GroupId = i64;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Rewarded,
}

impl ReferralStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Rewarded => "rewarded",
        }
    }

    /// Only `pending -> rewarded` is a legal move.
    pub fn can_transition_to(self, next: ReferralStatus) -> bool {
        matches!(
            (self, next),
            (ReferralStatus::Pending, ReferralStatus::Rewarded)
        )
    }
}

impl fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferralStatus {
    type Err = ReferralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReferralStatus::Pending),
            "rewarded" => Ok(ReferralStatus::Rewarded),
            other => Err(ReferralError::Corrupt {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// What one beneficiary receives.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RewardTerms {
    pub balance: Decimal,
    pub group_id: Option<GroupId>,
    pub subscription_days: u32,
}

impl RewardTerms {
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.group_id.is_none() && self.subscription_days == 0
    }

    /// The subscription part, when both a group and a positive duration are set.
    pub fn subscription(&self) -> Option<(GroupId, u32)> {
        match self.group_id {
            Some(group) if self.subscription_days > 0 => Some((group, self.subscription_days)),
            _ => None,
        }
    }
}

/// Reward amounts frozen at distribution time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RewardSnapshot {
    pub referrer: RewardTerms,
    pub referee: RewardTerms,
}

impl RewardSnapshot {
    pub fn is_empty(&self) -> bool {
        self.referrer.is_empty() && self.referee.is_empty()
    }
}

/// One row per referee.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralRelationship {
    pub id: ReferralId,
    pub referrer_id: UserId,
    pub referee_id: UserId,
    pub status: ReferralStatus,
    pub reward: RewardSnapshot,
    pub referrer_rewarded_at: Option<DateTime<Utc>>,
    pub referee_rewarded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReferralRelationship {
    pub fn is_rewarded(&self) -> bool {
        self.status == ReferralStatus::Rewarded
    }
}

/// A relationship as shown in listings, with emails attached.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralEntry {
    #[serde(flatten)]
    pub relationship: ReferralRelationship,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referee_email: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReferralStats {
    pub total_count: u64,
    pub rewarded_count: u64,
    pub pending_count: u64,
    pub total_balance_earned: Decimal,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralInfo {
    pub referral_code: String,
    pub referral_link: String,
    pub stats: ReferralStats,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }.normalized()
    }

    /// Clamp to `page >= 1` and `1 <= page_size <= MAX_PAGE_SIZE`.
    pub fn normalized(self) -> Self {
        let page = self.page.max(1);
        let page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        Self { page, page_size }
    }

    pub fn limit(&self) -> u32 {
        self.normalized().page_size
    }

    pub fn offset(&self) -> u64 {
        let n = self.normalized();
        u64::from(n.page - 1) * u64::from(n.page_size)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let request = request.normalized();
        let size = u64::from(request.page_size);
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            pages: (total + size - 1) / size,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
            pages: self.pages,
        }
    }
}
