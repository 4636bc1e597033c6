//! Reward planning.
//!
//! Turns a relationship plus a frozen [`RewardSnapshot`] into the ordered
//! list of grants the distributor applies. Planning is pure: nothing here
//! touches storage.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{GroupId, ReferralRelationship, RewardSnapshot, RewardTerms, UserId};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Beneficiary {
    Referrer,
    Referee,
}

impl Beneficiary {
    pub const fn as_str(self) -> &'static str {
        match self {
            Beneficiary::Referrer => "referrer",
            Beneficiary::Referee => "referee",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardGrant {
    Balance {
        beneficiary: Beneficiary,
        user_id: UserId,
        amount: Decimal,
        audit_notes: String,
    },
    Subscription {
        beneficiary: Beneficiary,
        user_id: UserId,
        group_id: GroupId,
        validity_days: u32,
        notes: String,
    },
}

impl RewardGrant {
    pub fn beneficiary(&self) -> Beneficiary {
        match self {
            RewardGrant::Balance { beneficiary, .. }
            | RewardGrant::Subscription { beneficiary, .. } => *beneficiary,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            RewardGrant::Balance { user_id, .. } | RewardGrant::Subscription { user_id, .. } => {
                *user_id
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RewardPlan {
    pub grants: Vec<RewardGrant>,
}

impl RewardPlan {
    /// Grants in application order: referrer balance, referrer subscription,
    /// referee balance, referee subscription. Zero amounts and incomplete
    /// subscription terms are left out.
    pub fn for_relationship(rel: &ReferralRelationship, snapshot: &RewardSnapshot) -> Self {
        let mut grants = Vec::with_capacity(4);
        push_terms(&mut grants, Beneficiary::Referrer, rel, &snapshot.referrer);
        push_terms(&mut grants, Beneficiary::Referee, rel, &snapshot.referee);
        Self { grants }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn total_balance(&self) -> Decimal {
        self.grants
            .iter()
            .map(|grant| match grant {
                RewardGrant::Balance { amount, .. } => *amount,
                RewardGrant::Subscription { .. } => Decimal::ZERO,
            })
            .sum()
    }
}

fn push_terms(
    grants: &mut Vec<RewardGrant>,
    beneficiary: Beneficiary,
    rel: &ReferralRelationship,
    terms: &RewardTerms,
) {
    let user_id = match beneficiary {
        Beneficiary::Referrer => rel.referrer_id,
        Beneficiary::Referee => rel.referee_id,
    };
    if terms.balance > Decimal::ZERO {
        grants.push(RewardGrant::Balance {
            beneficiary,
            user_id,
            amount: terms.balance,
            audit_notes: audit_notes(beneficiary, rel),
        });
    }
    if let Some((group_id, validity_days)) = terms.subscription() {
        grants.push(RewardGrant::Subscription {
            beneficiary,
            user_id,
            group_id,
            validity_days,
            notes: subscription_notes(beneficiary, rel),
        });
    }
}

fn subscription_notes(beneficiary: Beneficiary, rel: &ReferralRelationship) -> String {
    match beneficiary {
        Beneficiary::Referrer => format!(
            "referral reward: referred user {} signed up and topped up",
            rel.referee_id
        ),
        Beneficiary::Referee => "referral reward: signed up via referral link and topped up".into(),
    }
}

fn audit_notes(beneficiary: Beneficiary, rel: &ReferralRelationship) -> String {
    match beneficiary {
        Beneficiary::Referrer => format!(
            "referral reward: referred user {} completed first top-up",
            rel.referee_id
        ),
        Beneficiary::Referee => "referral reward: first top-up after signing up via referral link".into(),
    }
}
