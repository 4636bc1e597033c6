//! Referee-scoped reward lock.
//!
//! A keyed, TTL-bounded set-if-absent primitive. Release is best-effort:
//! the TTL reclaims a lock whose holder crashed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ReferralError;
use crate::model::UserId;
use crate::policy::Operation;

pub const REWARD_LOCK_PREFIX: &str = "referral:reward:";
pub const REWARD_LOCK_TTL: Duration = Duration::from_secs(30);

pub fn reward_lock_key(referee_id: UserId) -> String {
    format!("{REWARD_LOCK_PREFIX}{referee_id}")
}

pub trait RewardLock: Send + Sync {
    /// Take the lock for `referee_id` if nobody holds it. `Ok(false)` means
    /// contended.
    fn acquire(&self, referee_id: UserId) -> Result<bool, ReferralError>;

    /// Clear the lock unconditionally.
    fn release(&self, referee_id: UserId) -> Result<(), ReferralError>;
}

/// Releases the lock when dropped; release failures are only logged.
pub struct RewardLockGuard<'a> {
    lock: &'a dyn RewardLock,
    referee_id: UserId,
}

impl<'a> RewardLockGuard<'a> {
    /// `Ok(None)` when another holder has the lock.
    pub fn try_acquire(
        lock: &'a dyn RewardLock,
        referee_id: UserId,
    ) -> Result<Option<Self>, ReferralError> {
        if lock.acquire(referee_id)? {
            Ok(Some(Self { lock, referee_id }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for RewardLockGuard<'_> {
    fn drop(&mut self) {
        let key = reward_lock_key(self.referee_id);
        // LockRelease never propagates; the TTL covers a leaked lock.
        let _ = Operation::LockRelease.absorb(self.lock.release(self.referee_id), &key);
    }
}

/// Single-process lock: a map of key to expiry.
pub struct MemoryRewardLock {
    ttl: Duration,
    held: Mutex<HashMap<String, Instant>>,
}

impl Default for MemoryRewardLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRewardLock {
    pub fn new() -> Self {
        Self::with_ttl(REWARD_LOCK_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_held(&self, referee_id: UserId) -> bool {
        let key = reward_lock_key(referee_id);
        match self.held.lock() {
            Ok(held) => held.get(&key).is_some_and(|expiry| *expiry > Instant::now()),
            Err(_) => false,
        }
    }
}

impl RewardLock for MemoryRewardLock {
    fn acquire(&self, referee_id: UserId) -> Result<bool, ReferralError> {
        let key = reward_lock_key(referee_id);
        let now = Instant::now();
        let mut held = self
            .held
            .lock()
            .map_err(|_| ReferralError::Lock("lock table poisoned".into()))?;
        if let Some(expiry) = held.get(&key) {
            if *expiry > now {
                debug!(key = %key, "reward lock contended");
                return Ok(false);
            }
            warn!(key = %key, "reclaiming expired reward lock");
        }
        held.insert(key, now + self.ttl);
        Ok(true)
    }

    fn release(&self, referee_id: UserId) -> Result<(), ReferralError> {
        let key = reward_lock_key(referee_id);
        let mut held = self
            .held
            .lock()
            .map_err(|_| ReferralError::Lock("lock table poisoned".into()))?;
        held.remove(&key);
        Ok(())
    }
}
