//! Referral rewards.
//!
//! Users share a referral code; whoever signs up with it becomes their
//! referee. When the referee completes a first top-up, both sides are
//! credited once, according to the reward settings in force at that moment.
//!
//! The crate is synchronous. All persistent state lives in one SQLite
//! database (see [`store`]); the per-referee [`lock`] keeps concurrent
//! triggers from crediting twice.

pub mod error;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod policy;
pub mod referrals;
pub mod rewards;
pub mod service;
pub mod settings;
pub mod store;
pub mod subscription;

pub use error::ReferralError;
pub use model::{
    Page, PageRequest, ReferralEntry, ReferralInfo, ReferralRelationship, ReferralStats,
    ReferralStatus, RewardSnapshot, RewardTerms,
};
pub use service::{mask_email, ReferralService, Registration, RewardOutcome};
pub use settings::ReferralSettings;
pub use store::{Database, Scope};
