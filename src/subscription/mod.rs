//! Subscription assignment.
//!
//! `assign_or_extend` runs through `Database::run_in_tx`, so when the caller
//! hands in a transactional scope every write lands in that transaction
//! instead of committing on its own.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::ReferralError;
use crate::model::{GroupId, UserId};
use crate::store::{Database, Scope};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Expired,
}

impl SubscriptionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
        }
    }

    fn parse(raw: &str) -> Result<Self, ReferralError> {
        match raw {
            "active" => Ok(SubscriptionStatus::Active),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(ReferralError::Corrupt {
                column: "user_subscriptions.status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: i64,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub status: SubscriptionStatus,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub notes: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignSubscription {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub validity_days: u32,
    /// 0 for system grants.
    pub assigned_by: UserId,
    pub notes: String,
}

pub trait SubscriptionAssigner: Send + Sync {
    /// Extend the user's active or suspended subscription to the group, or
    /// create a new one. The flag is `true` when an existing one was extended.
    fn assign_or_extend(
        &self,
        scope: &Scope<'_>,
        input: &AssignSubscription,
    ) -> Result<(Subscription, bool), ReferralError>;
}

pub struct SqliteSubscriptionService {
    db: Database,
}

impl SqliteSubscriptionService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn list_by_user(
        &self,
        scope: &Scope<'_>,
        user_id: UserId,
    ) -> Result<Vec<Subscription>, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, user_id, group_id, status, starts_at, expires_at, notes
                 FROM user_subscriptions WHERE user_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, UserId>(1)?,
                    row.get::<_, GroupId>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                    row.get::<_, DateTime<Utc>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, user_id, group_id, status, starts_at, expires_at, notes) = row?;
                out.push(Subscription {
                    id,
                    user_id,
                    group_id,
                    status: SubscriptionStatus::parse(&status)?,
                    starts_at,
                    expires_at,
                    notes,
                });
            }
            Ok(out)
        })
    }
}

/// New expiry when extending: count from the later of now and the current expiry.
pub fn extended_expiry(
    current: DateTime<Utc>,
    now: DateTime<Utc>,
    validity_days: u32,
) -> DateTime<Utc> {
    current.max(now) + Duration::days(i64::from(validity_days))
}

fn append_notes(existing: &str, extra: &str) -> String {
    match (existing.is_empty(), extra.is_empty()) {
        (_, true) => existing.to_string(),
        (true, false) => extra.to_string(),
        (false, false) => format!("{existing}\n{extra}"),
    }
}

impl SubscriptionAssigner for SqliteSubscriptionService {
    fn assign_or_extend(
        &self,
        scope: &Scope<'_>,
        input: &AssignSubscription,
    ) -> Result<(Subscription, bool), ReferralError> {
        if input.validity_days == 0 {
            return Err(ReferralError::Collaborator(
                "subscription validity must be at least one day".into(),
            ));
        }
        let now = Utc::now();
        self.db.run_in_tx(scope, |tx| {
            self.db.with_conn(tx, |conn| {
                let existing = conn
                    .query_row(
                        "SELECT id, status, starts_at, expires_at, notes FROM user_subscriptions
                         WHERE user_id = ?1 AND group_id = ?2 AND status IN ('active', 'suspended')
                         ORDER BY id DESC LIMIT 1",
                        params![input.user_id, input.group_id],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, DateTime<Utc>>(2)?,
                                row.get::<_, DateTime<Utc>>(3)?,
                                row.get::<_, String>(4)?,
                            ))
                        },
                    )
                    .optional()?;

                match existing {
                    Some((id, starts_at, expires_at, notes)) => {
                        let expires_at = extended_expiry(expires_at, now, input.validity_days);
                        let notes = append_notes(&notes, &input.notes);
                        conn.execute(
                            "UPDATE user_subscriptions
                             SET status = ?1, expires_at = ?2, notes = ?3, updated_at = ?4
                             WHERE id = ?5",
                            params![
                                SubscriptionStatus::Active.as_str(),
                                expires_at,
                                notes,
                                now,
                                id
                            ],
                        )?;
                        Ok((
                            Subscription {
                                id,
                                user_id: input.user_id,
                                group_id: input.group_id,
                                status: SubscriptionStatus::Active,
                                starts_at,
                                expires_at,
                                notes,
                            },
                            true,
                        ))
                    }
                    None => {
                        let expires_at = now + Duration::days(i64::from(input.validity_days));
                        conn.execute(
                            "INSERT INTO user_subscriptions
                                (user_id, group_id, status, starts_at, expires_at, assigned_by,
                                 notes, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?4, ?4)",
                            params![
                                input.user_id,
                                input.group_id,
                                SubscriptionStatus::Active.as_str(),
                                now,
                                expires_at,
                                input.assigned_by,
                                input.notes,
                            ],
                        )?;
                        Ok((
                            Subscription {
                                id: conn.last_insert_rowid(),
                                user_id: input.user_id,
                                group_id: input.group_id,
                                status: SubscriptionStatus::Active,
                                starts_at: now,
                                expires_at,
                                notes: input.notes.clone(),
                            },
                            false,
                        ))
                    }
                }
            })
        })
    }
}
