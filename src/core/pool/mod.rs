//! Shared pool of rate-limited upstream accounts.
//!
//! All account records live behind one mutex, so reserve, release and
//! cooldown updates are serialized and two concurrent reservations can never
//! both take the last slot of an account. The lock is a `std::sync::Mutex`
//! because `AccountLease` releases from `Drop`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::{ExhaustedPolicy, PoolConfig};
use crate::core::error::{CoreError, CoreResult};

/// Provisioning record, usually from `[[accounts]]` in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
    pub id: String,
    pub organization_id: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    1
}

struct AccountState {
    spec: AccountSpec,
    in_flight: usize,
    rate_limited: bool,
    cooldown_until: Option<Instant>,
    usage: f64,
    usage_at: Instant,
    last_used: Option<Instant>,
}

impl AccountState {
    fn new(spec: AccountSpec, now: Instant) -> Self {
        Self {
            spec,
            in_flight: 0,
            rate_limited: false,
            cooldown_until: None,
            usage: 0.0,
            usage_at: now,
            last_used: None,
        }
    }

    fn decayed_usage(&self, now: Instant, half_life: Duration) -> f64 {
        if half_life.is_zero() {
            return 0.0;
        }
        let elapsed = now.saturating_duration_since(self.usage_at).as_secs_f64();
        self.usage * 0.5_f64.powf(elapsed / half_life.as_secs_f64())
    }

    /// Estimated pressure relative to capacity; lower drains slower.
    fn drain_rate(&self, now: Instant, half_life: Duration) -> f64 {
        (self.decayed_usage(now, half_life) + self.in_flight as f64)
            / self.spec.max_concurrency.max(1) as f64
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    fn eligible(&self, now: Instant) -> bool {
        !self.in_cooldown(now) && self.in_flight < self.spec.max_concurrency
    }
}

/// Point-in-time view of one account for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub organization_id: String,
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub rate_limited: bool,
    pub cooldown_remaining_ms: Option<u64>,
    pub usage: f64,
}

pub enum Reservation {
    Granted(AccountLease),
    /// Nothing eligible right now. `retry_in` is set when the earliest
    /// cooldown expiry is known.
    Queued { retry_in: Option<Duration> },
}

struct PoolInner {
    accounts: Mutex<HashMap<String, AccountState>>,
    released: Notify,
    releases: AtomicUsize,
    config: PoolConfig,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, AccountState>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, account_id: &str) {
        {
            let mut accounts = self.lock();
            match accounts.get_mut(account_id) {
                Some(account) => account.in_flight = account.in_flight.saturating_sub(1),
                None => warn!("Released unknown account [{}]", account_id),
            }
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.released.notify_waiters();
        debug!("Released account [{}]", account_id);
    }
}

/// A reserved slot on one account. Released exactly once, through
/// `AccountPool::release` or on drop.
pub struct AccountLease {
    account_id: String,
    pool: Arc<PoolInner>,
    released: bool,
}

impl AccountLease {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.account_id);
        }
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for AccountLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLease")
            .field("account_id", &self.account_id)
            .field("released", &self.released)
            .finish()
    }
}

#[derive(Clone)]
pub struct AccountPool {
    inner: Arc<PoolInner>,
}

impl AccountPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                accounts: Mutex::new(HashMap::new()),
                released: Notify::new(),
                releases: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// Add an account, or update the capacity of an existing one while
    /// keeping its in-flight count and cooldown.
    pub fn provision(&self, spec: AccountSpec) -> CoreResult<()> {
        if spec.max_concurrency == 0 {
            return Err(CoreError::Config(format!(
                "account '{}' must allow at least one concurrent execution",
                spec.id
            )));
        }
        let now = Instant::now();
        {
            let mut accounts = self.inner.lock();
            match accounts.get_mut(&spec.id) {
                Some(existing) => existing.spec = spec.clone(),
                None => {
                    accounts.insert(spec.id.clone(), AccountState::new(spec.clone(), now));
                }
            }
        }
        self.inner.released.notify_waiters();
        info!(
            "Provisioned account [{}] for organization [{}] (max {})",
            spec.id, spec.organization_id, spec.max_concurrency
        );
        Ok(())
    }

    /// Non-blocking attempt. Affinity wins when that account is eligible;
    /// otherwise the lowest drain rate, then least recently used.
    pub fn try_reserve(
        &self,
        organization_id: &str,
        affinity: Option<&str>,
    ) -> CoreResult<Reservation> {
        let now = Instant::now();
        let half_life = Duration::from_secs(self.inner.config.usage_half_life_secs);
        let mut accounts = self.inner.lock();

        let mut known = false;
        let mut earliest_cooldown: Option<Instant> = None;
        let mut best: Option<(&String, f64, Option<Instant>)> = None;
        let mut preferred: Option<&String> = None;

        for (id, account) in accounts.iter_mut() {
            if account.spec.organization_id != organization_id {
                continue;
            }
            known = true;
            if account.rate_limited && !account.in_cooldown(now) {
                account.rate_limited = false;
                account.cooldown_until = None;
            }
            if let Some(until) = account.cooldown_until.filter(|u| *u > now) {
                earliest_cooldown = Some(earliest_cooldown.map_or(until, |e| e.min(until)));
            }
            if !account.eligible(now) {
                continue;
            }
            if affinity == Some(id.as_str()) {
                preferred = Some(id);
            }
            let rate = account.drain_rate(now, half_life);
            let better = match &best {
                None => true,
                Some((_, best_rate, best_used)) => match rate.total_cmp(best_rate) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    // never used sorts before any instant
                    std::cmp::Ordering::Equal => account.last_used < *best_used,
                },
            };
            if better {
                best = Some((id, rate, account.last_used));
            }
        }

        if !known {
            return Err(CoreError::AccountsExhausted {
                organization_id: organization_id.to_string(),
            });
        }

        let Some(chosen) = preferred.or(best.map(|(id, _, _)| id)).cloned() else {
            return Ok(Reservation::Queued {
                retry_in: earliest_cooldown.map(|until| until - now),
            });
        };

        if let Some(account) = accounts.get_mut(&chosen) {
            account.usage = account.decayed_usage(now, half_life) + 1.0;
            account.usage_at = now;
            account.in_flight += 1;
            account.last_used = Some(now);
        }
        debug!("Reserved account [{}] for organization [{}]", chosen, organization_id);

        Ok(Reservation::Granted(AccountLease {
            account_id: chosen,
            pool: self.inner.clone(),
            released: false,
        }))
    }

    /// Reserve according to the configured exhausted policy: wait up to
    /// `queue_wait` (woken on release or cooldown expiry), or fail at once.
    pub async fn reserve(
        &self,
        organization_id: &str,
        affinity: Option<&str>,
    ) -> CoreResult<AccountLease> {
        let policy = self.inner.config.exhausted_policy;
        let deadline = Instant::now() + self.inner.config.queue_wait();

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retry_in = match self.try_reserve(organization_id, affinity)? {
                Reservation::Granted(lease) => return Ok(lease),
                Reservation::Queued { retry_in } => retry_in,
            };

            let now = Instant::now();
            if policy == ExhaustedPolicy::Fail || now >= deadline {
                warn!(
                    "No account available for organization [{}]",
                    organization_id
                );
                return Err(CoreError::AccountsExhausted {
                    organization_id: organization_id.to_string(),
                });
            }

            let wake_at = retry_in.map_or(deadline, |d| (now + d).min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    pub fn release(&self, mut lease: AccountLease) {
        lease.release_once();
    }

    /// Put an account into cooldown after an upstream rate-limit signal.
    pub fn report_rate_limited(&self, account_id: &str, cooldown: Option<Duration>) {
        let cooldown = cooldown.unwrap_or_else(|| self.inner.config.default_cooldown());
        let mut accounts = self.inner.lock();
        if let Some(account) = accounts.get_mut(account_id) {
            let until = Instant::now() + cooldown;
            account.rate_limited = true;
            account.cooldown_until = Some(account.cooldown_until.map_or(until, |u| u.max(until)));
            warn!(
                "Account [{}] rate limited, cooling down for {}s",
                account_id,
                cooldown.as_secs()
            );
        }
    }

    pub fn snapshot(&self, organization_id: &str) -> Vec<AccountSnapshot> {
        let now = Instant::now();
        let half_life = Duration::from_secs(self.inner.config.usage_half_life_secs);
        let accounts = self.inner.lock();
        let mut out: Vec<AccountSnapshot> = accounts
            .values()
            .filter(|a| a.spec.organization_id == organization_id)
            .map(|a| AccountSnapshot {
                id: a.spec.id.clone(),
                organization_id: a.spec.organization_id.clone(),
                max_concurrency: a.spec.max_concurrency,
                in_flight: a.in_flight,
                rate_limited: a.in_cooldown(now),
                cooldown_remaining_ms: a
                    .cooldown_until
                    .filter(|u| *u > now)
                    .map(|u| (u - now).as_millis() as u64),
                usage: a.decayed_usage(now, half_life),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Total releases so far.
    pub fn release_count(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(policy: ExhaustedPolicy, wait_secs: u64) -> AccountPool {
        AccountPool::new(PoolConfig {
            exhausted_policy: policy,
            queue_wait_secs: wait_secs,
            ..PoolConfig::default()
        })
    }

    fn account(id: &str, max: usize) -> AccountSpec {
        AccountSpec {
            id: id.into(),
            organization_id: "org".into(),
            max_concurrency: max,
        }
    }

    fn granted(r: Reservation) -> AccountLease {
        match r {
            Reservation::Granted(lease) => lease,
            Reservation::Queued { .. } => panic!("expected a lease"),
        }
    }

    #[tokio::test]
    async fn rate_limited_account_is_skipped() {
        let pool = pool(ExhaustedPolicy::Fail, 0);
        pool.provision(account("A", 2)).unwrap();
        pool.provision(account("B", 2)).unwrap();
        pool.report_rate_limited("A", Some(Duration::from_secs(60)));

        let lease = pool.reserve("org", None).await.unwrap();
        assert_eq!(lease.account_id(), "B");
    }

    #[tokio::test]
    async fn affinity_is_honored_when_eligible() {
        let pool = pool(ExhaustedPolicy::Fail, 0);
        pool.provision(account("A", 1)).unwrap();
        pool.provision(account("B", 1)).unwrap();
        let lease = pool.reserve("org", Some("B")).await.unwrap();
        assert_eq!(lease.account_id(), "B");
        // B is full now, affinity falls back to A
        let other = pool.reserve("org", Some("B")).await.unwrap();
        assert_eq!(other.account_id(), "A");
    }

    #[tokio::test]
    async fn load_spreads_to_least_used_account() {
        let pool = pool(ExhaustedPolicy::Fail, 0);
        pool.provision(account("A", 4)).unwrap();
        pool.provision(account("B", 4)).unwrap();
        let first = pool.reserve("org", None).await.unwrap();
        let second = pool.reserve("org", None).await.unwrap();
        assert_ne!(first.account_id(), second.account_id());
    }

    #[tokio::test]
    async fn fail_policy_reports_exhaustion_immediately() {
        let pool = pool(ExhaustedPolicy::Fail, 30);
        pool.provision(account("A", 1)).unwrap();
        let _held = pool.reserve("org", None).await.unwrap();
        let err = pool.reserve("org", None).await.unwrap_err();
        assert!(matches!(err, CoreError::AccountsExhausted { .. }));
    }

    #[tokio::test]
    async fn unknown_organization_is_exhausted() {
        let pool = pool(ExhaustedPolicy::Queue, 30);
        let err = pool.reserve("nobody", None).await.unwrap_err();
        assert_eq!(err.kind(), "accounts_exhausted");
    }

    #[tokio::test]
    async fn queued_reservation_is_granted_after_release() {
        let pool = pool(ExhaustedPolicy::Queue, 5);
        pool.provision(account("A", 1)).unwrap();
        let held = pool.reserve("org", None).await.unwrap();
        assert!(matches!(
            pool.try_reserve("org", None).unwrap(),
            Reservation::Queued { retry_in: None }
        ));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reserve("org", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.account_id(), "A");
    }

    #[tokio::test]
    async fn queued_reservation_wakes_when_cooldown_expires() {
        let pool = pool(ExhaustedPolicy::Queue, 5);
        pool.provision(account("A", 1)).unwrap();
        pool.report_rate_limited("A", Some(Duration::from_millis(50)));
        match pool.try_reserve("org", None).unwrap() {
            Reservation::Queued { retry_in } => assert!(retry_in.is_some()),
            Reservation::Granted(_) => panic!("account should be cooling down"),
        }
        let lease = pool.reserve("org", None).await.unwrap();
        assert_eq!(lease.account_id(), "A");
        assert!(!pool.snapshot("org")[0].rate_limited);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversubscribe() {
        let pool = pool(ExhaustedPolicy::Fail, 0);
        pool.provision(account("A", 2)).unwrap();
        pool.provision(account("B", 1)).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.reserve("org", None).await }));
        }
        let mut leases = Vec::new();
        for t in tasks {
            if let Ok(lease) = t.await.unwrap() {
                leases.push(lease);
            }
        }
        assert_eq!(leases.len(), 3);
        for snap in pool.snapshot("org") {
            assert!(snap.in_flight <= snap.max_concurrency);
        }
    }

    #[tokio::test]
    async fn lease_releases_exactly_once() {
        let pool = pool(ExhaustedPolicy::Fail, 0);
        pool.provision(account("A", 1)).unwrap();
        let lease = granted(pool.try_reserve("org", None).unwrap());
        pool.release(lease);
        assert_eq!(pool.release_count(), 1);
        assert_eq!(pool.snapshot("org")[0].in_flight, 0);

        {
            let _dropped = granted(pool.try_reserve("org", None).unwrap());
        }
        assert_eq!(pool.release_count(), 2);
        assert_eq!(pool.snapshot("org")[0].in_flight, 0);
    }

    #[test]
    fn zero_capacity_accounts_are_rejected() {
        let pool = pool(ExhaustedPolicy::Fail, 0);
        assert!(pool.provision(account("A", 0)).is_err());
    }
}
