//! Durable referrer/referee pairs.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::error::ReferralError;
use crate::model::{
    GroupId, Page, PageRequest, ReferralId, ReferralRelationship, ReferralStatus, RewardSnapshot,
    RewardTerms, UserId,
};
use crate::store::{parse_decimal, Database, Scope};

pub type TxBody<'f> = dyn FnMut(&Scope<'_>) -> Result<(), ReferralError> + 'f;

pub trait ReferralStore: Send + Sync {
    /// Record a pending relationship. `AlreadyExists` if the referee already
    /// has one, `SelfReferral` if both ids match.
    fn create(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
        referee_id: UserId,
    ) -> Result<ReferralRelationship, ReferralError>;

    fn get_by_referee(
        &self,
        scope: &Scope<'_>,
        referee_id: UserId,
    ) -> Result<ReferralRelationship, ReferralError>;

    fn get_by_id(
        &self,
        scope: &Scope<'_>,
        id: ReferralId,
    ) -> Result<ReferralRelationship, ReferralError>;

    /// Move a relationship forward. Moving to `Rewarded` writes `snapshot`
    /// and stamps both rewarded-at timestamps in the same statement.
    fn update_status(
        &self,
        scope: &Scope<'_>,
        id: ReferralId,
        status: ReferralStatus,
        snapshot: Option<&RewardSnapshot>,
    ) -> Result<(), ReferralError>;

    fn count_by_referrer(&self, scope: &Scope<'_>, referrer_id: UserId)
        -> Result<u64, ReferralError>;

    fn count_by_referrer_and_status(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
        status: ReferralStatus,
    ) -> Result<u64, ReferralError>;

    /// Sum of the referrer balance reward over rewarded rows only.
    fn sum_referrer_balance_reward(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
    ) -> Result<Decimal, ReferralError>;

    /// Newest first.
    fn list_by_referrer(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
        page: PageRequest,
    ) -> Result<Page<ReferralRelationship>, ReferralError>;

    /// Newest first.
    fn list_all(
        &self,
        scope: &Scope<'_>,
        page: PageRequest,
    ) -> Result<Page<ReferralRelationship>, ReferralError>;

    /// Run `body` atomically, joining `scope`'s transaction when it has one.
    /// A failing body leaves none of its writes behind, even when joined.
    fn run_in_tx(&self, scope: &Scope<'_>, body: &mut TxBody<'_>) -> Result<(), ReferralError>;
}

pub struct SqliteReferralStore {
    db: Database,
}

impl SqliteReferralStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

const REFERRAL_COLUMNS: &str = "id, referrer_id, referee_id, status,
    referrer_balance_reward, referrer_group_id, referrer_subscription_days, referrer_rewarded_at,
    referee_balance_reward, referee_group_id, referee_subscription_days, referee_rewarded_at,
    created_at, updated_at";

struct RawReferral {
    id: ReferralId,
    referrer_id: UserId,
    referee_id: UserId,
    status: String,
    referrer_balance: String,
    referrer_group: Option<GroupId>,
    referrer_days: u32,
    referrer_rewarded_at: Option<DateTime<Utc>>,
    referee_balance: String,
    referee_group: Option<GroupId>,
    referee_days: u32,
    referee_rewarded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawReferral {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            referrer_id: row.get(1)?,
            referee_id: row.get(2)?,
            status: row.get(3)?,
            referrer_balance: row.get(4)?,
            referrer_group: row.get(5)?,
            referrer_days: row.get(6)?,
            referrer_rewarded_at: row.get(7)?,
            referee_balance: row.get(8)?,
            referee_group: row.get(9)?,
            referee_days: row.get(10)?,
            referee_rewarded_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_relationship(self) -> Result<ReferralRelationship, ReferralError> {
        Ok(ReferralRelationship {
            id: self.id,
            referrer_id: self.referrer_id,
            referee_id: self.referee_id,
            status: self.status.parse()?,
            reward: RewardSnapshot {
                referrer: RewardTerms {
                    balance: parse_decimal("referrer_balance_reward", &self.referrer_balance)?,
                    group_id: self.referrer_group,
                    subscription_days: self.referrer_days,
                },
                referee: RewardTerms {
                    balance: parse_decimal("referee_balance_reward", &self.referee_balance)?,
                    group_id: self.referee_group,
                    subscription_days: self.referee_days,
                },
            },
            referrer_rewarded_at: self.referrer_rewarded_at,
            referee_rewarded_at: self.referee_rewarded_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn fetch_one(
    conn: &Connection,
    filter: &str,
    value: i64,
) -> Result<ReferralRelationship, ReferralError> {
    conn.query_row(
        &format!("SELECT {REFERRAL_COLUMNS} FROM user_referrals WHERE {filter} = ?1"),
        params![value],
        RawReferral::from_row,
    )
    .optional()?
    .ok_or(ReferralError::NotFound("referral"))?
    .into_relationship()
}

fn fetch_page(
    conn: &Connection,
    referrer_id: Option<UserId>,
    page: PageRequest,
) -> Result<Page<ReferralRelationship>, ReferralError> {
    let page = page.normalized();
    let (filter, args): (&str, Vec<i64>) = match referrer_id {
        Some(id) => ("WHERE referrer_id = ?1", vec![id]),
        None => ("", Vec::new()),
    };
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM user_referrals {filter}"),
        rusqlite::params_from_iter(args.iter()),
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM user_referrals {filter}
         ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
        page.limit(),
        page.offset()
    ))?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), RawReferral::from_row)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(row?.into_relationship()?);
    }
    Ok(Page::new(items, total as u64, page))
}

impl ReferralStore for SqliteReferralStore {
    fn create(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
        referee_id: UserId,
    ) -> Result<ReferralRelationship, ReferralError> {
        if referrer_id == referee_id {
            return Err(ReferralError::SelfReferral);
        }
        let now = Utc::now();
        let id = self.db.with_conn(scope, |conn| {
            conn.execute(
                "INSERT INTO user_referrals (referrer_id, referee_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![referrer_id, referee_id, ReferralStatus::Pending.as_str(), now],
            )
            .map_err(ReferralError::from_sqlite)?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(ReferralRelationship {
            id,
            referrer_id,
            referee_id,
            status: ReferralStatus::Pending,
            reward: RewardSnapshot::default(),
            referrer_rewarded_at: None,
            referee_rewarded_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_by_referee(
        &self,
        scope: &Scope<'_>,
        referee_id: UserId,
    ) -> Result<ReferralRelationship, ReferralError> {
        self.db
            .with_conn(scope, |conn| fetch_one(conn, "referee_id", referee_id))
    }

    fn get_by_id(
        &self,
        scope: &Scope<'_>,
        id: ReferralId,
    ) -> Result<ReferralRelationship, ReferralError> {
        self.db.with_conn(scope, |conn| fetch_one(conn, "id", id))
    }

    fn update_status(
        &self,
        scope: &Scope<'_>,
        id: ReferralId,
        status: ReferralStatus,
        snapshot: Option<&RewardSnapshot>,
    ) -> Result<(), ReferralError> {
        let now = Utc::now();
        let empty = RewardSnapshot::default();
        let reward = snapshot.unwrap_or(&empty);
        self.db.with_conn(scope, |conn| {
            if !ReferralStatus::Pending.can_transition_to(status) {
                let current = fetch_one(conn, "id", id)?;
                return Err(ReferralError::InvalidTransition {
                    id,
                    from: current.status,
                    to: status,
                });
            }
            // guarded on the current status so a lost race cannot rewrite a
            // rewarded row
            let changed = conn.execute(
                "UPDATE user_referrals SET
                    status = ?1,
                    referrer_balance_reward = ?2, referrer_group_id = ?3,
                    referrer_subscription_days = ?4, referrer_rewarded_at = ?5,
                    referee_balance_reward = ?6, referee_group_id = ?7,
                    referee_subscription_days = ?8, referee_rewarded_at = ?5,
                    updated_at = ?9
                 WHERE id = ?10 AND status = ?11",
                params![
                    status.as_str(),
                    reward.referrer.balance.to_string(),
                    reward.referrer.group_id,
                    reward.referrer.subscription_days,
                    now,
                    reward.referee.balance.to_string(),
                    reward.referee.group_id,
                    reward.referee.subscription_days,
                    now,
                    id,
                    ReferralStatus::Pending.as_str(),
                ],
            )?;
            if changed == 1 {
                return Ok(());
            }
            let current = fetch_one(conn, "id", id)?;
            Err(ReferralError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            })
        })
    }

    fn count_by_referrer(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
    ) -> Result<u64, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_referrals WHERE referrer_id = ?1",
                params![referrer_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    fn count_by_referrer_and_status(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
        status: ReferralStatus,
    ) -> Result<u64, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_referrals WHERE referrer_id = ?1 AND status = ?2",
                params![referrer_id, status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    fn sum_referrer_balance_reward(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
    ) -> Result<Decimal, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT referrer_balance_reward FROM user_referrals
                 WHERE referrer_id = ?1 AND status = ?2",
            )?;
            let rows = stmt.query_map(
                params![referrer_id, ReferralStatus::Rewarded.as_str()],
                |row| row.get::<_, String>(0),
            )?;
            let mut total = Decimal::ZERO;
            for raw in rows {
                total += parse_decimal("referrer_balance_reward", &raw?)?;
            }
            Ok(total)
        })
    }

    fn list_by_referrer(
        &self,
        scope: &Scope<'_>,
        referrer_id: UserId,
        page: PageRequest,
    ) -> Result<Page<ReferralRelationship>, ReferralError> {
        self.db
            .with_conn(scope, |conn| fetch_page(conn, Some(referrer_id), page))
    }

    fn list_all(
        &self,
        scope: &Scope<'_>,
        page: PageRequest,
    ) -> Result<Page<ReferralRelationship>, ReferralError> {
        self.db.with_conn(scope, |conn| fetch_page(conn, None, page))
    }

    fn run_in_tx(&self, scope: &Scope<'_>, body: &mut TxBody<'_>) -> Result<(), ReferralError> {
        self.db.run_in_savepoint(scope, |tx| body(tx))
    }
}
