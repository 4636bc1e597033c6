use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ReferralError;
use crate::model::UserId;
use crate::store::{parse_decimal, Database, Scope};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    /// Empty until the user first asks for referral info.
    pub referral_code: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// User directory and balance ledger.
pub trait UserDirectory: Send + Sync {
    fn get_by_id(&self, scope: &Scope<'_>, id: UserId) -> Result<User, ReferralError>;

    /// Persist profile fields (email, referral code). `AlreadyExists` when the
    /// referral code is taken.
    fn update(&self, scope: &Scope<'_>, user: &User) -> Result<(), ReferralError>;

    fn get_by_referral_code(&self, scope: &Scope<'_>, code: &str) -> Result<User, ReferralError>;

    /// Atomically add `delta` to the user's balance.
    fn update_balance(
        &self,
        scope: &Scope<'_>,
        id: UserId,
        delta: Decimal,
    ) -> Result<(), ReferralError>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    ReferralReward,
}

impl RewardKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RewardKind::ReferralReward => "referral_reward",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewardRecordStatus {
    Used,
}

impl RewardRecordStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RewardRecordStatus::Used => "used",
        }
    }
}

/// Audit entry for one applied balance credit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardRecord {
    pub code: String,
    pub kind: RewardKind,
    pub status: RewardRecordStatus,
    pub beneficiary_id: UserId,
    pub amount: Decimal,
    pub notes: String,
    pub used_at: Option<DateTime<Utc>>,
}

impl RewardRecord {
    /// A referral reward that has already been credited.
    pub fn referral_credit(beneficiary_id: UserId, amount: Decimal, notes: String) -> Self {
        Self {
            code: random_record_code(),
            kind: RewardKind::ReferralReward,
            status: RewardRecordStatus::Used,
            beneficiary_id,
            amount,
            notes,
            used_at: Some(Utc::now()),
        }
    }
}

fn random_record_code() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub trait RewardAuditLog: Send + Sync {
    fn record(&self, scope: &Scope<'_>, record: &RewardRecord) -> Result<(), ReferralError>;
}

pub struct SqliteUserDirectory {
    db: Database,
}

impl SqliteUserDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, scope: &Scope<'_>, email: &str) -> Result<User, ReferralError> {
        let now = Utc::now();
        let id = self.db.with_conn(scope, |conn| {
            conn.execute(
                "INSERT INTO users (email, balance, created_at) VALUES (?1, '0', ?2)",
                params![email, now],
            )
            .map_err(ReferralError::from_sqlite)?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(User {
            id,
            email: email.to_string(),
            referral_code: String::new(),
            balance: Decimal::ZERO,
            created_at: now,
        })
    }
}

const USER_COLUMNS: &str = "id, email, referral_code, balance, created_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<(User, String)> {
    let balance: String = row.get(3)?;
    Ok((
        User {
            id: row.get(0)?,
            email: row.get(1)?,
            referral_code: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            balance: Decimal::ZERO,
            created_at: row.get(4)?,
        },
        balance,
    ))
}

fn finish_user((mut user, balance): (User, String)) -> Result<User, ReferralError> {
    user.balance = parse_decimal("users.balance", &balance)?;
    Ok(user)
}

impl UserDirectory for SqliteUserDirectory {
    fn get_by_id(&self, scope: &Scope<'_>, id: UserId) -> Result<User, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    params![id],
                    user_from_row,
                )
                .optional()?
                .ok_or(ReferralError::NotFound("user"))?;
            finish_user(row)
        })
    }

    fn update(&self, scope: &Scope<'_>, user: &User) -> Result<(), ReferralError> {
        let code = (!user.referral_code.is_empty()).then_some(user.referral_code.as_str());
        let changed = self.db.with_conn(scope, |conn| {
            conn.execute(
                "UPDATE users SET email = ?1, referral_code = ?2 WHERE id = ?3",
                params![user.email, code, user.id],
            )
            .map_err(ReferralError::from_sqlite)
        })?;
        if changed == 0 {
            return Err(ReferralError::NotFound("user"));
        }
        Ok(())
    }

    fn get_by_referral_code(&self, scope: &Scope<'_>, code: &str) -> Result<User, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE referral_code = ?1"),
                    params![code],
                    user_from_row,
                )
                .optional()?
                .ok_or(ReferralError::NotFound("user"))?;
            finish_user(row)
        })
    }

    fn update_balance(
        &self,
        scope: &Scope<'_>,
        id: UserId,
        delta: Decimal,
    ) -> Result<(), ReferralError> {
        // read-modify-write stays atomic: the unit below runs either inside
        // the caller's transaction or under the connection mutex
        self.db.run_in_tx(scope, |tx| {
            self.db.with_conn(tx, |conn| {
                let raw: String = conn
                    .query_row("SELECT balance FROM users WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?
                    .ok_or(ReferralError::NotFound("user"))?;
                let balance = parse_decimal("users.balance", &raw)?
                    .checked_add(delta)
                    .ok_or(ReferralError::BalanceOverflow { user_id: id })?;
                conn.execute(
                    "UPDATE users SET balance = ?1 WHERE id = ?2",
                    params![balance.normalize().to_string(), id],
                )?;
                Ok(())
            })
        })
    }
}

pub struct SqliteRewardAuditLog {
    db: Database,
}

impl SqliteRewardAuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn list_by_beneficiary(
        &self,
        scope: &Scope<'_>,
        beneficiary_id: UserId,
    ) -> Result<Vec<RewardRecord>, ReferralError> {
        self.db.with_conn(scope, |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT code, beneficiary_id, amount, notes, used_at
                 FROM reward_records WHERE beneficiary_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![beneficiary_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, UserId>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<DateTime<Utc>>>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (code, beneficiary_id, amount, notes, used_at) = row?;
                out.push(RewardRecord {
                    code,
                    kind: RewardKind::ReferralReward,
                    status: RewardRecordStatus::Used,
                    beneficiary_id,
                    amount: parse_decimal("reward_records.amount", &amount)?,
                    notes,
                    used_at,
                });
            }
            Ok(out)
        })
    }
}

impl RewardAuditLog for SqliteRewardAuditLog {
    fn record(&self, scope: &Scope<'_>, record: &RewardRecord) -> Result<(), ReferralError> {
        let now = Utc::now();
        self.db.with_conn(scope, |conn| {
            conn.execute(
                "INSERT INTO reward_records
                    (code, kind, status, beneficiary_id, amount, notes, used_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.code,
                    record.kind.as_str(),
                    record.status.as_str(),
                    record.beneficiary_id,
                    record.amount.to_string(),
                    record.notes,
                    record.used_at,
                    now,
                ],
            )
            .map_err(ReferralError::from_sqlite)?;
            Ok(())
        })
    }
}
