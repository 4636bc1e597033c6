use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use rust_decimal::Decimal;

use super::*;
use crate::ledger::{RewardRecord, User};
use crate::lock::RewardLock;
use crate::model::{PageRequest, ReferralStatus, UserId};
use crate::subscription::{AssignSubscription, Subscription, SubscriptionStatus};

/// Counts acquisitions so tests can assert the lock was never touched.
struct CountingLock {
    inner: MemoryRewardLock,
    acquires: AtomicUsize,
}

impl RewardLock for CountingLock {
    fn acquire(&self, referee_id: UserId) -> Result<bool, ReferralError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(referee_id)
    }

    fn release(&self, referee_id: UserId) -> Result<(), ReferralError> {
        self.inner.release(referee_id)
    }
}

/// Wraps the SQLite directory and injects failures.
struct FlakyUsers {
    inner: Arc<SqliteUserDirectory>,
    fail_credit_for: Option<UserId>,
    reject_codes: bool,
    updates: AtomicUsize,
}

impl FlakyUsers {
    fn new(inner: Arc<SqliteUserDirectory>) -> Self {
        Self {
            inner,
            fail_credit_for: None,
            reject_codes: false,
            updates: AtomicUsize::new(0),
        }
    }
}

impl UserDirectory for FlakyUsers {
    fn get_by_id(&self, scope: &Scope<'_>, id: UserId) -> Result<User, ReferralError> {
        self.inner.get_by_id(scope, id)
    }

    fn update(&self, scope: &Scope<'_>, user: &User) -> Result<(), ReferralError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.reject_codes {
            return Err(ReferralError::AlreadyExists);
        }
        self.inner.update(scope, user)
    }

    fn get_by_referral_code(&self, scope: &Scope<'_>, code: &str) -> Result<User, ReferralError> {
        self.inner.get_by_referral_code(scope, code)
    }

    fn update_balance(
        &self,
        scope: &Scope<'_>,
        id: UserId,
        delta: Decimal,
    ) -> Result<(), ReferralError> {
        if self.fail_credit_for == Some(id) {
            return Err(ReferralError::Collaborator("ledger unavailable".into()));
        }
        self.inner.update_balance(scope, id, delta)
    }
}

/// Records the scope each grant ran in; optionally fails every grant.
#[derive(Default)]
struct RecordingSubscriptions {
    fail: bool,
    calls: Mutex<Vec<(AssignSubscription, bool)>>,
}

impl SubscriptionAssigner for RecordingSubscriptions {
    fn assign_or_extend(
        &self,
        scope: &Scope<'_>,
        input: &AssignSubscription,
    ) -> Result<(Subscription, bool), ReferralError> {
        self.calls
            .lock()
            .unwrap()
            .push((input.clone(), scope.in_transaction()));
        if self.fail {
            return Err(ReferralError::Collaborator("subscription service down".into()));
        }
        let now = Utc::now();
        Ok((
            Subscription {
                id: 1,
                user_id: input.user_id,
                group_id: input.group_id,
                status: SubscriptionStatus::Active,
                starts_at: now,
                expires_at: now,
                notes: input.notes.clone(),
            },
            false,
        ))
    }
}

/// Settings backend that is entirely offline.
struct OfflineSettings;

impl SettingsStore for OfflineSettings {
    fn get_value(&self, _: &Scope<'_>, _: &str) -> Result<String, ReferralError> {
        Err(ReferralError::Collaborator("settings offline".into()))
    }

    fn get_multiple(
        &self,
        _: &Scope<'_>,
        _: &[&str],
    ) -> Result<BTreeMap<String, String>, ReferralError> {
        Err(ReferralError::Collaborator("settings offline".into()))
    }

    fn set_multiple(
        &self,
        _: &Scope<'_>,
        _: &BTreeMap<String, String>,
    ) -> Result<(), ReferralError> {
        Err(ReferralError::Collaborator("settings offline".into()))
    }
}

struct Fixture {
    db: Database,
    referrals: Arc<SqliteReferralStore>,
    users: Arc<SqliteUserDirectory>,
    settings: Arc<SqliteSettingsStore>,
    audit: Arc<SqliteRewardAuditLog>,
    subscriptions: Arc<SqliteSubscriptionService>,
    lock: Arc<CountingLock>,
    service: ReferralService,
}

impl Fixture {
    fn new() -> Self {
        let db = Database::open_in_memory().unwrap();
        let referrals = Arc::new(SqliteReferralStore::new(db.clone()));
        let users = Arc::new(SqliteUserDirectory::new(db.clone()));
        let settings = Arc::new(SqliteSettingsStore::new(db.clone()));
        let audit = Arc::new(SqliteRewardAuditLog::new(db.clone()));
        let subscriptions = Arc::new(SqliteSubscriptionService::new(db.clone()));
        let lock = Arc::new(CountingLock {
            inner: MemoryRewardLock::new(),
            acquires: AtomicUsize::new(0),
        });
        let service = ReferralService::new(
            referrals.clone(),
            lock.clone(),
            users.clone(),
            settings.clone(),
        )
        .with_subscriptions(subscriptions.clone())
        .with_audit_log(audit.clone());
        Self {
            db,
            referrals,
            users,
            settings,
            audit,
            subscriptions,
            lock,
            service,
        }
    }

    /// A second service over the same storage with some collaborators swapped.
    fn service_with(
        &self,
        users: Arc<dyn UserDirectory>,
        subscriptions: Arc<dyn SubscriptionAssigner>,
    ) -> ReferralService {
        ReferralService::new(
            self.referrals.clone(),
            self.lock.clone(),
            users,
            self.settings.clone(),
        )
        .with_subscriptions(subscriptions)
        .with_audit_log(self.audit.clone())
    }

    fn configure(&self, settings: ReferralSettings) {
        self.service
            .update_referral_settings(&Scope::detached(), &settings)
            .unwrap();
    }

    fn user(&self, email: &str) -> User {
        self.users.create(&Scope::detached(), email).unwrap()
    }

    fn user_with_code(&self, email: &str, code: &str) -> User {
        let mut user = self.user(email);
        user.referral_code = code.into();
        self.users.update(&Scope::detached(), &user).unwrap();
        user
    }

    fn balance(&self, id: UserId) -> Decimal {
        self.users.get_by_id(&Scope::detached(), id).unwrap().balance
    }

    fn status(&self, referee_id: UserId) -> ReferralStatus {
        self.referrals
            .get_by_referee(&Scope::detached(), referee_id)
            .unwrap()
            .status
    }

    fn audit_for(&self, id: UserId) -> Vec<RewardRecord> {
        self.audit.list_by_beneficiary(&Scope::detached(), id).unwrap()
    }

    /// alice refers bob.
    fn referred_pair(&self) -> (User, User) {
        let alice = self.user_with_code("alice@example.com", "ALICE123");
        let bob = self.user("bob@example.com");
        let registration = self
            .service
            .register_referral(&Scope::detached(), "ALICE123", bob.id);
        assert!(registration.is_recorded(), "{registration:?}");
        (alice, bob)
    }
}

fn balances(referrer: Decimal, referee: Decimal) -> ReferralSettings {
    ReferralSettings {
        enabled: true,
        referrer_balance_reward: referrer,
        referee_balance_reward: referee,
        ..ReferralSettings::default()
    }
}

fn with_subscriptions(mut settings: ReferralSettings) -> ReferralSettings {
    settings.referrer_group_id = Some(7);
    settings.referrer_subscription_days = 30;
    settings.referee_group_id = Some(8);
    settings.referee_subscription_days = 7;
    settings
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

#[test]
fn first_top_up_credits_both_sides_and_records_snapshot() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    let (alice, bob) = f.referred_pair();

    let outcome = f.service.trigger_referral_reward(&Scope::detached(), bob.id);
    assert!(outcome.is_rewarded(), "{outcome:?}");

    assert_eq!(f.balance(alice.id), dec("12.50"));
    assert_eq!(f.balance(bob.id), dec("7.75"));

    let rel = f.referrals.get_by_referee(&Scope::detached(), bob.id).unwrap();
    assert_eq!(rel.status, ReferralStatus::Rewarded);
    assert_eq!(rel.reward.referrer.balance, dec("12.50"));
    assert_eq!(rel.reward.referee.balance, dec("7.75"));
    assert_eq!(rel.reward.referrer.group_id, None);
    assert!(rel.referrer_rewarded_at.is_some());
    assert!(rel.referee_rewarded_at.is_some());

    for (id, amount) in [(alice.id, dec("12.50")), (bob.id, dec("7.75"))] {
        let records = f.audit_for(id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, amount);
        assert!(records[0].used_at.is_some());
        assert!(records[0].notes.contains("first top-up"));
    }
}

#[test]
fn second_trigger_is_a_no_op() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    let (alice, bob) = f.referred_pair();

    assert!(f
        .service
        .trigger_referral_reward(&Scope::detached(), bob.id)
        .is_rewarded());
    let acquires = f.lock.acquires.load(Ordering::SeqCst);

    let again = f.service.trigger_referral_reward(&Scope::detached(), bob.id);
    assert_eq!(again, RewardOutcome::AlreadyRewarded);
    assert_eq!(f.lock.acquires.load(Ordering::SeqCst), acquires);
    assert_eq!(f.balance(alice.id), dec("12.50"));
    assert_eq!(f.audit_for(alice.id).len(), 1);
}

#[test]
fn concurrent_triggers_credit_exactly_once() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    let (alice, bob) = f.referred_pair();

    let outcomes: Vec<RewardOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| f.service.trigger_referral_reward(&Scope::detached(), bob.id)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let rewarded = outcomes.iter().filter(|o| o.is_rewarded()).count();
    assert_eq!(rewarded, 1, "{outcomes:?}");
    for outcome in outcomes.iter().filter(|o| !o.is_rewarded()) {
        assert!(
            matches!(
                outcome,
                RewardOutcome::AlreadyRewarded | RewardOutcome::LockContended
            ),
            "{outcome:?}"
        );
    }
    assert_eq!(f.balance(alice.id), dec("12.50"));
    assert_eq!(f.balance(bob.id), dec("7.75"));
    assert_eq!(f.audit_for(alice.id).len(), 1);
}

#[test]
fn disabled_feature_touches_nothing() {
    let f = Fixture::new();
    let (alice, bob) = {
        f.configure(balances(dec("12.50"), dec("7.75")));
        f.referred_pair()
    };
    f.configure(ReferralSettings {
        enabled: false,
        ..balances(dec("12.50"), dec("7.75"))
    });

    let outcome = f.service.trigger_referral_reward(&Scope::detached(), bob.id);
    assert_eq!(outcome, RewardOutcome::Disabled);
    assert_eq!(f.lock.acquires.load(Ordering::SeqCst), 0);
    assert_eq!(f.status(bob.id), ReferralStatus::Pending);
    assert_eq!(f.balance(alice.id), Decimal::ZERO);
    assert!(f.audit_for(alice.id).is_empty());
}

#[test]
fn referee_without_relationship_is_ignored() {
    let f = Fixture::new();
    f.configure(balances(dec("1"), dec("1")));
    let carol = f.user("carol@example.com");
    assert_eq!(
        f.service.trigger_referral_reward(&Scope::detached(), carol.id),
        RewardOutcome::NoRelationship
    );
    assert_eq!(f.lock.acquires.load(Ordering::SeqCst), 0);
}

#[test]
fn contended_lock_skips_the_attempt() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    let (alice, bob) = f.referred_pair();

    assert!(f.lock.inner.acquire(bob.id).unwrap());
    let outcome = f.service.trigger_referral_reward(&Scope::detached(), bob.id);
    assert_eq!(outcome, RewardOutcome::LockContended);
    assert_eq!(f.status(bob.id), ReferralStatus::Pending);
    assert_eq!(f.balance(alice.id), Decimal::ZERO);

    f.lock.inner.release(bob.id).unwrap();
    assert!(f
        .service
        .trigger_referral_reward(&Scope::detached(), bob.id)
        .is_rewarded());
    assert!(!f.lock.inner.is_held(bob.id));
}

#[test]
fn registration_with_invalid_code_is_swallowed() {
    let f = Fixture::new();
    f.configure(balances(dec("1"), dec("1")));
    let bob = f.user("bob@example.com");
    let registration = f
        .service
        .register_referral(&Scope::detached(), "NOPE0000", bob.id);
    assert!(matches!(
        registration,
        Registration::Skipped(ReferralError::InvalidCode)
    ));
    assert!(f
        .referrals
        .get_by_referee(&Scope::detached(), bob.id)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn registration_without_code_or_when_disabled_records_nothing() {
    let f = Fixture::new();
    let alice = f.user_with_code("alice@example.com", "ALICE123");
    let bob = f.user("bob@example.com");
    assert!(matches!(
        f.service.register_referral(&Scope::detached(), "  ", bob.id),
        Registration::NoCode
    ));
    assert!(matches!(
        f.service
            .register_referral(&Scope::detached(), "ALICE123", bob.id),
        Registration::Skipped(ReferralError::Disabled)
    ));
    assert_eq!(
        f.referrals
            .count_by_referrer(&Scope::detached(), alice.id)
            .unwrap(),
        0
    );
}

#[test]
fn self_referral_and_second_referrer_are_ignored() {
    let f = Fixture::new();
    f.configure(balances(dec("1"), dec("1")));
    let (alice, bob) = f.referred_pair();
    let _carol = f.user_with_code("carol@example.com", "CAROL123");

    assert!(matches!(
        f.service
            .register_referral(&Scope::detached(), "ALICE123", alice.id),
        Registration::Skipped(ReferralError::SelfReferral)
    ));
    assert!(matches!(
        f.service
            .register_referral(&Scope::detached(), "CAROL123", bob.id),
        Registration::Skipped(ReferralError::AlreadyExists)
    ));
    let rel = f.referrals.get_by_referee(&Scope::detached(), bob.id).unwrap();
    assert_eq!(rel.referrer_id, alice.id);
}

#[test]
fn referrer_at_limit_gets_no_more_referrals() {
    let f = Fixture::new();
    f.configure(ReferralSettings {
        max_per_user: 1,
        ..balances(dec("1"), dec("1"))
    });
    let (alice, bob) = f.referred_pair();
    let carol = f.user("carol@example.com");

    let registration = f
        .service
        .register_referral(&Scope::detached(), "ALICE123", carol.id);
    assert!(matches!(
        registration,
        Registration::Skipped(ReferralError::MaxReached { limit: 1 })
    ));
    assert_eq!(
        f.referrals
            .count_by_referrer(&Scope::detached(), alice.id)
            .unwrap(),
        1
    );
    assert_eq!(f.status(bob.id), ReferralStatus::Pending);
}

#[test]
fn count_tracks_registrations_regardless_of_reward() {
    let f = Fixture::new();
    f.configure(balances(dec("2"), dec("1")));
    let alice = f.user_with_code("alice@example.com", "ALICE123");
    let referees: Vec<User> = (0..4)
        .map(|i| f.user(&format!("friend{i}@example.com")))
        .collect();
    for referee in &referees {
        assert!(f
            .service
            .register_referral(&Scope::detached(), "ALICE123", referee.id)
            .is_recorded());
    }
    f.service
        .trigger_referral_reward(&Scope::detached(), referees[0].id);
    assert_eq!(
        f.referrals
            .count_by_referrer(&Scope::detached(), alice.id)
            .unwrap(),
        4
    );
}

#[test]
fn snapshot_reflects_settings_at_distribution_time() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    let (alice, bob) = f.referred_pair();
    f.configure(balances(dec("20"), dec("3.10")));

    f.service.trigger_referral_reward(&Scope::detached(), bob.id);

    let rel = f.referrals.get_by_referee(&Scope::detached(), bob.id).unwrap();
    assert_eq!(rel.reward.referrer.balance, dec("20"));
    assert_eq!(rel.reward.referee.balance, dec("3.10"));
    assert_eq!(f.balance(alice.id), dec("20"));

    // later changes do not rewrite history
    f.configure(balances(dec("99"), dec("99")));
    let rel = f.referrals.get_by_referee(&Scope::detached(), bob.id).unwrap();
    assert_eq!(rel.reward.referrer.balance, dec("20"));
}

#[test]
fn failed_balance_credit_aborts_and_stays_retryable() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    let (alice, bob) = f.referred_pair();

    let flaky = FlakyUsers {
        fail_credit_for: Some(bob.id),
        ..FlakyUsers::new(f.users.clone())
    };
    let broken = f.service_with(Arc::new(flaky), f.subscriptions.clone());
    let outcome = broken.trigger_referral_reward(&Scope::detached(), bob.id);
    assert!(matches!(outcome, RewardOutcome::Aborted { .. }), "{outcome:?}");

    // the referrer credit made before the failure is rolled back too
    assert_eq!(f.status(bob.id), ReferralStatus::Pending);
    assert_eq!(f.balance(alice.id), Decimal::ZERO);
    assert!(f.audit_for(alice.id).is_empty());
    assert!(!f.lock.inner.is_held(bob.id));

    assert!(f
        .service
        .trigger_referral_reward(&Scope::detached(), bob.id)
        .is_rewarded());
    assert_eq!(f.balance(alice.id), dec("12.50"));
}

#[test]
fn aborted_reward_leaves_nothing_in_a_committed_top_up() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    let (alice, bob) = f.referred_pair();

    let flaky = FlakyUsers {
        fail_credit_for: Some(bob.id),
        ..FlakyUsers::new(f.users.clone())
    };
    let broken = f.service_with(Arc::new(flaky), f.subscriptions.clone());
    f.db.run_in_tx(&Scope::detached(), |tx| {
        f.users.update_balance(tx, bob.id, dec("100"))?;
        let outcome = broken.trigger_referral_reward(tx, bob.id);
        assert!(matches!(outcome, RewardOutcome::Aborted { .. }), "{outcome:?}");
        Ok(())
    })
    .unwrap();

    // the top-up committed, the referrer credit made before the failure did not
    assert_eq!(f.balance(bob.id), dec("100"));
    assert_eq!(f.balance(alice.id), Decimal::ZERO);
    assert!(f.audit_for(alice.id).is_empty());
    assert_eq!(f.status(bob.id), ReferralStatus::Pending);

    assert!(f
        .service
        .trigger_referral_reward(&Scope::detached(), bob.id)
        .is_rewarded());
    assert_eq!(f.balance(alice.id), dec("12.50"));
    assert_eq!(f.balance(bob.id), dec("107.75"));
    assert_eq!(f.audit_for(alice.id).len(), 1);
}

#[test]
fn zero_rewards_still_mark_the_referral_rewarded() {
    let f = Fixture::new();
    f.configure(balances(Decimal::ZERO, Decimal::ZERO));
    let (alice, bob) = f.referred_pair();

    let outcome = f.service.trigger_referral_reward(&Scope::detached(), bob.id);
    assert!(outcome.is_rewarded(), "{outcome:?}");
    assert_eq!(f.status(bob.id), ReferralStatus::Rewarded);
    assert_eq!(f.balance(alice.id), Decimal::ZERO);
    assert!(f.audit_for(alice.id).is_empty());
    assert!(f.audit_for(bob.id).is_empty());
}

#[test]
fn failed_subscription_grant_does_not_block_reward() {
    let f = Fixture::new();
    f.configure(with_subscriptions(balances(dec("12.50"), dec("7.75"))));
    let (alice, bob) = f.referred_pair();

    let subscriptions = Arc::new(RecordingSubscriptions {
        fail: true,
        ..RecordingSubscriptions::default()
    });
    let service = f.service_with(f.users.clone(), subscriptions.clone());
    let outcome = service.trigger_referral_reward(&Scope::detached(), bob.id);
    assert!(outcome.is_rewarded(), "{outcome:?}");

    assert_eq!(subscriptions.calls.lock().unwrap().len(), 2);
    assert_eq!(f.balance(alice.id), dec("12.50"));
    assert_eq!(f.balance(bob.id), dec("7.75"));
    assert_eq!(f.status(bob.id), ReferralStatus::Rewarded);
}

#[test]
fn subscription_grants_follow_plan_order_inside_a_transaction() {
    let f = Fixture::new();
    f.configure(with_subscriptions(balances(dec("1"), dec("1"))));
    let (alice, bob) = f.referred_pair();

    let subscriptions = Arc::new(RecordingSubscriptions::default());
    let service = f.service_with(f.users.clone(), subscriptions.clone());
    assert!(service
        .trigger_referral_reward(&Scope::detached(), bob.id)
        .is_rewarded());

    let calls = subscriptions.calls.lock().unwrap();
    let seen: Vec<_> = calls
        .iter()
        .map(|(input, in_tx)| (input.user_id, input.group_id, input.validity_days, *in_tx))
        .collect();
    assert_eq!(seen, vec![(alice.id, 7, 30, true), (bob.id, 8, 7, true)]);
    assert!(calls.iter().all(|(input, _)| input.assigned_by == 0));
}

#[test]
fn reward_joins_the_enclosing_top_up_transaction() {
    let f = Fixture::new();
    f.configure(with_subscriptions(balances(dec("12.50"), dec("7.75"))));
    let (alice, bob) = f.referred_pair();

    let result: Result<(), ReferralError> = f.db.run_in_tx(&Scope::detached(), |tx| {
        f.users.update_balance(tx, bob.id, dec("100"))?;
        let outcome = f.service.trigger_referral_reward(tx, bob.id);
        assert!(outcome.is_rewarded(), "{outcome:?}");
        assert_eq!(f.subscriptions.list_by_user(tx, alice.id)?.len(), 1);
        Err(ReferralError::Collaborator("top-up rejected".into()))
    });
    assert!(result.is_err());

    // everything the reward wrote went down with the top-up
    assert_eq!(f.status(bob.id), ReferralStatus::Pending);
    assert_eq!(f.balance(bob.id), Decimal::ZERO);
    assert_eq!(f.balance(alice.id), Decimal::ZERO);
    assert!(f
        .subscriptions
        .list_by_user(&Scope::detached(), alice.id)
        .unwrap()
        .is_empty());
    assert!(f.audit_for(alice.id).is_empty());

    f.db.run_in_tx(&Scope::detached(), |tx| {
        f.users.update_balance(tx, bob.id, dec("100"))?;
        assert!(f.service.trigger_referral_reward(tx, bob.id).is_rewarded());
        Ok(())
    })
    .unwrap();
    assert_eq!(f.balance(bob.id), dec("107.75"));
    let subs = f
        .subscriptions
        .list_by_user(&Scope::detached(), bob.id)
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].group_id, 8);
}

#[test]
fn settings_update_validates_and_notifies() {
    let f = Fixture::new();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    f.service.set_on_settings_updated(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let settings = with_subscriptions(ReferralSettings {
        max_per_user: 5,
        ..balances(dec("12.5"), dec("0.123456789"))
    });
    f.service
        .update_referral_settings(&Scope::detached(), &settings)
        .unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    let read = f.service.get_referral_settings(&Scope::detached());
    assert_eq!(read.referrer_balance_reward, dec("12.5"));
    assert_eq!(read.referee_balance_reward, dec("0.12345679"));
    assert_eq!(read.referrer_group_id, Some(7));
    assert_eq!(read.max_per_user, 5);
    assert!(f.service.is_referral_enabled(&Scope::detached()));

    let negative = balances(dec("-1"), Decimal::ZERO);
    let err = f
        .service
        .update_referral_settings(&Scope::detached(), &negative)
        .unwrap_err();
    assert!(matches!(err, ReferralError::InvalidSettings(_)));
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(
        f.service
            .get_referral_settings(&Scope::detached())
            .referrer_balance_reward,
        dec("12.5")
    );
}

#[test]
fn unreadable_settings_mean_disabled_and_writes_propagate() {
    let f = Fixture::new();
    let service = ReferralService::new(
        f.referrals.clone(),
        f.lock.clone(),
        f.users.clone(),
        Arc::new(OfflineSettings),
    );
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    service.set_on_settings_updated(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!service.is_referral_enabled(&Scope::detached()));
    assert_eq!(
        service.get_referral_settings(&Scope::detached()),
        ReferralSettings::default()
    );
    assert!(matches!(
        service.update_referral_settings(&Scope::detached(), &balances(dec("1"), dec("1"))),
        Err(ReferralError::Collaborator(_))
    ));
    assert_eq!(notified.load(Ordering::SeqCst), 0);
    assert_eq!(
        service.trigger_referral_reward(&Scope::detached(), 1),
        RewardOutcome::Disabled
    );
}

#[test]
fn referral_info_generates_a_stable_code_and_stats() {
    let f = Fixture::new();
    f.configure(balances(dec("12.50"), dec("7.75")));
    f.settings
        .set_multiple(
            &Scope::detached(),
            &BTreeMap::from([(
                crate::settings::KEY_API_BASE_URL.to_string(),
                "https://example.com/".to_string(),
            )]),
        )
        .unwrap();

    let alice = f.user("alice@example.com");
    let info = f.service.get_referral_info(&Scope::detached(), alice.id).unwrap();
    assert_eq!(info.referral_code.len(), 8);
    assert_eq!(
        info.referral_link,
        format!("https://example.com/register?ref={}", info.referral_code)
    );
    assert_eq!(info.stats, crate::model::ReferralStats::default());

    let friends: Vec<User> = ["bob@example.com", "carol@example.com"]
        .into_iter()
        .map(|email| f.user(email))
        .collect();
    for friend in &friends {
        assert!(f
            .service
            .register_referral(&Scope::detached(), &info.referral_code, friend.id)
            .is_recorded());
    }
    f.service
        .trigger_referral_reward(&Scope::detached(), friends[0].id);

    let again = f.service.get_referral_info(&Scope::detached(), alice.id).unwrap();
    assert_eq!(again.referral_code, info.referral_code);
    assert_eq!(again.stats.total_count, 2);
    assert_eq!(again.stats.rewarded_count, 1);
    assert_eq!(again.stats.pending_count, 1);
    assert_eq!(again.stats.total_balance_earned, dec("12.50"));
}

#[test]
fn referral_link_is_empty_without_base_url() {
    let f = Fixture::new();
    let alice = f.user("alice@example.com");
    let info = f.service.get_referral_info(&Scope::detached(), alice.id).unwrap();
    assert!(!info.referral_code.is_empty());
    assert_eq!(info.referral_link, "");
    assert_eq!(referral_link("", "abc"), "");
    assert_eq!(
        referral_link("https://a.example", "abc"),
        "https://a.example/register?ref=abc"
    );
}

#[test]
fn code_generation_gives_up_after_repeated_collisions() {
    let f = Fixture::new();
    let alice = f.user("alice@example.com");
    let users = Arc::new(FlakyUsers {
        reject_codes: true,
        ..FlakyUsers::new(f.users.clone())
    });
    let service = f.service_with(users.clone(), f.subscriptions.clone());

    let err = service
        .generate_referral_code(&Scope::detached(), alice.id)
        .unwrap_err();
    assert!(matches!(
        err,
        ReferralError::CodeExhausted {
            attempts: REFERRAL_CODE_ATTEMPTS
        }
    ));
    assert_eq!(
        users.updates.load(Ordering::SeqCst),
        REFERRAL_CODE_ATTEMPTS as usize
    );
}

#[test]
fn random_codes_are_url_safe() {
    for _ in 0..64 {
        let code = random_referral_code();
        assert_eq!(code.len(), 8);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}

#[test]
fn history_masks_emails_and_admin_listing_does_not() {
    let f = Fixture::new();
    f.configure(balances(dec("1"), dec("1")));
    let (alice, _bob) = f.referred_pair();
    let dora = f.user("dora.explorer@example.com");
    f.service
        .register_referral(&Scope::detached(), "ALICE123", dora.id);

    let history = f
        .service
        .get_referral_history(&Scope::detached(), alice.id, PageRequest::default())
        .unwrap();
    assert_eq!(history.total, 2);
    let emails: Vec<_> = history
        .items
        .iter()
        .map(|e| e.referee_email.clone().unwrap())
        .collect();
    assert_eq!(emails, vec!["do***@example.com", "bo***@example.com"]);
    assert!(history.items.iter().all(|e| e.referrer_email.is_none()));

    let all = f
        .service
        .get_all_referrals(&Scope::detached(), PageRequest::new(1, 1))
        .unwrap();
    assert_eq!(all.total, 2);
    assert_eq!(all.pages, 2);
    assert_eq!(all.items[0].referrer_email.as_deref(), Some("alice@example.com"));
    assert_eq!(
        all.items[0].referee_email.as_deref(),
        Some("dora.explorer@example.com")
    );
}

#[test]
fn email_masking_rules() {
    assert_eq!(mask_email("alice@example.com"), "al***@example.com");
    assert_eq!(mask_email("ab@x.io"), "a***@x.io");
    assert_eq!(mask_email("a@x.io"), "a***@x.io");
    assert_eq!(mask_email("@x.io"), "***");
    assert_eq!(mask_email("nobody"), "***");
    assert_eq!(mask_email(""), "***");
}
