use thiserror::Error;

use crate::model::{ReferralId, ReferralStatus, UserId};

/// Canonical error type for the referral subsystem.
#[derive(Debug, Error)]
pub enum ReferralError {
    /// No row for the requested entity (`"referral"`, `"user"`, `"setting"`, ...).
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("referral system is disabled")]
    Disabled,

    #[error("cannot refer yourself")]
    SelfReferral,

    /// Unique constraint hit: the referee already has a referrer, or a
    /// referral code is taken.
    #[error("record already exists")]
    AlreadyExists,

    #[error("referrer has reached maximum referral limit {limit}")]
    MaxReached { limit: u32 },

    #[error("invalid referral code")]
    InvalidCode,

    #[error("referral {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ReferralId,
        from: ReferralStatus,
        to: ReferralStatus,
    },

    #[error("invalid referral settings: {0}")]
    InvalidSettings(String),

    #[error("failed to generate unique referral code after {attempts} attempts")]
    CodeExhausted { attempts: u32 },

    #[error("reward lock backend failure: {0}")]
    Lock(String),

    /// Failure reported by an external collaborator (ledger, subscriptions).
    #[error("collaborator failure: {0}")]
    Collaborator(String),

    #[error("balance of user {user_id} would overflow")]
    BalanceOverflow { user_id: UserId },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage handle poisoned")]
    Poisoned,

    #[error("malformed stored value in {column}: {value:?}")]
    Corrupt { column: &'static str, value: String },
}

impl ReferralError {
    /// Map a SQLite failure, turning unique-constraint violations into
    /// [`ReferralError::AlreadyExists`].
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                ReferralError::AlreadyExists
            }
            _ => ReferralError::Storage(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReferralError::NotFound(_))
    }
}
