//! SQLite storage shared by every backend in this crate.
//!
//! All backends (referrals, users, settings, subscriptions, reward records)
//! talk to one [`Database`]. A [`Scope`] is passed down explicitly to every
//! storage call: a detached scope means "manage your own atomic unit", a
//! transactional scope means "join the transaction the caller opened".

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};
use rust_decimal::Decimal;

use crate::error::ReferralError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    email         TEXT NOT NULL UNIQUE,
    referral_code TEXT UNIQUE,
    balance       TEXT NOT NULL DEFAULT '0',
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_referrals (
    id                         INTEGER PRIMARY KEY AUTOINCREMENT,
    referrer_id                INTEGER NOT NULL,
    referee_id                 INTEGER NOT NULL UNIQUE,
    status                     TEXT NOT NULL DEFAULT 'pending',
    referrer_balance_reward    TEXT NOT NULL DEFAULT '0',
    referrer_group_id          INTEGER,
    referrer_subscription_days INTEGER NOT NULL DEFAULT 0,
    referrer_rewarded_at       TEXT,
    referee_balance_reward     TEXT NOT NULL DEFAULT '0',
    referee_group_id           INTEGER,
    referee_subscription_days  INTEGER NOT NULL DEFAULT 0,
    referee_rewarded_at        TEXT,
    created_at                 TEXT NOT NULL,
    updated_at                 TEXT NOT NULL,
    CHECK (referrer_id <> referee_id)
);
CREATE INDEX IF NOT EXISTS idx_user_referrals_referrer ON user_referrals (referrer_id);
CREATE INDEX IF NOT EXISTS idx_user_referrals_status ON user_referrals (status);

CREATE TABLE IF NOT EXISTS user_subscriptions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL,
    group_id    INTEGER NOT NULL,
    status      TEXT NOT NULL,
    starts_at   TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    assigned_by INTEGER NOT NULL DEFAULT 0,
    notes       TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_subscriptions_user_group ON user_subscriptions (user_id, group_id);

CREATE TABLE IF NOT EXISTS reward_records (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    code           TEXT NOT NULL UNIQUE,
    kind           TEXT NOT NULL,
    status         TEXT NOT NULL,
    beneficiary_id INTEGER NOT NULL,
    amount         TEXT NOT NULL,
    notes          TEXT NOT NULL DEFAULT '',
    used_at        TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reward_records_beneficiary ON reward_records (beneficiary_id);
";

/// Handle to the resource scope a storage call runs in.
///
/// Scopes are only meaningful for backends built on the same [`Database`]:
/// a transactional scope carries that database's open transaction.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    tx: Option<&'a Transaction<'a>>,
}

impl Scope<'static> {
    pub fn detached() -> Self {
        Scope { tx: None }
    }
}

impl<'a> Scope<'a> {
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn transaction(&self) -> Option<&'a Transaction<'a>> {
        self.tx
    }
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database file and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self, ReferralError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ReferralError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ReferralError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ReferralError> {
        self.conn.lock().map_err(|_| ReferralError::Poisoned)
    }

    /// Run `f` against the scope's transaction, or against the bare
    /// connection (one implicit atomic statement at a time) when detached.
    pub fn with_conn<T>(
        &self,
        scope: &Scope<'_>,
        f: impl FnOnce(&Connection) -> Result<T, ReferralError>,
    ) -> Result<T, ReferralError> {
        match scope.transaction() {
            Some(tx) => f(&**tx),
            None => {
                let conn = self.lock()?;
                f(&*conn)
            }
        }
    }

    /// Run `f` atomically.
    ///
    /// A transactional `scope` is reused as is. Otherwise a new transaction
    /// is opened, committed when `f` succeeds and rolled back when it fails.
    pub fn run_in_tx<T>(
        &self,
        scope: &Scope<'_>,
        f: impl FnOnce(&Scope<'_>) -> Result<T, ReferralError>,
    ) -> Result<T, ReferralError> {
        if scope.in_transaction() {
            return f(scope);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let inner = Scope { tx: Some(&tx) };
        let out = f(&inner)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` as one all-or-nothing unit.
    ///
    /// Detached, this is [`Database::run_in_tx`]. Inside an open transaction
    /// `f` runs under a savepoint: a failure undoes only what `f` wrote and
    /// leaves the caller's own writes, and its transaction, intact.
    pub fn run_in_savepoint<T>(
        &self,
        scope: &Scope<'_>,
        f: impl FnOnce(&Scope<'_>) -> Result<T, ReferralError>,
    ) -> Result<T, ReferralError> {
        let Some(tx) = scope.transaction() else {
            return self.run_in_tx(scope, f);
        };
        tx.execute_batch("SAVEPOINT nested_unit")?;
        match f(scope) {
            Ok(out) => {
                tx.execute_batch("RELEASE nested_unit")?;
                Ok(out)
            }
            Err(err) => {
                tx.execute_batch("ROLLBACK TO nested_unit; RELEASE nested_unit")?;
                Err(err)
            }
        }
    }
}

pub(crate) fn parse_decimal(column: &'static str, raw: &str) -> Result<Decimal, ReferralError> {
    Decimal::from_str(raw.trim()).map_err(|_| ReferralError::Corrupt {
        column,
        value: raw.to_string(),
    })
}
