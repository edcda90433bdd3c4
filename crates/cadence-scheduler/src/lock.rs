//! Leadership lock with a TTL lease.
//!
//! At most one beat instance holds the lock at a time; a holder that dies
//! without releasing loses it after one TTL. Renewals and releases are guarded
//! by a per-instance token so an instance never extends or deletes a lease
//! someone else has taken over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};

/// Primitives of a shared key-value store with expiring keys.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Atomically set `key = value` with expiry `ttl` if `key` is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Reset the expiry of `key` to `ttl` if it currently holds `value`.
    async fn renew(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it currently holds `value`.
    async fn release(&self, key: &str, value: &str) -> Result<bool>;
}

/// In-process coordinator with clock-driven expiry.
///
/// Only coordinates engines that share the same instance, i.e. a single
/// process. Useful for single-node deployments and tests.
pub struct MemoryCoordinator {
    keys: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCoordinator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> Result<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SchedulerError::LockUnavailable(e.to_string()))?;
        Ok(self.clock.now() + ttl)
    }

    /// Current holder of `key`, if its lease has not expired.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone())
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires = self.expiry(ttl)?;
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        match keys.get(key) {
            Some((_, current)) if *current > now => Ok(false),
            _ => {
                keys.insert(key.to_string(), (value.to_string(), expires));
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires = self.expiry(ttl)?;
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        match keys.get_mut(key) {
            Some((holder, current)) if holder == value && *current > now => {
                *current = expires;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, value: &str) -> Result<bool> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.get(key).is_some_and(|(holder, _)| holder == value) {
            keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Redis coordinator: `SET NX PX` to acquire, token-checked Lua scripts to
/// renew and release.
pub struct RedisCoordinator {
    conn: redis::aio::ConnectionManager,
    renew: redis::Script,
    release: redis::Script,
}

impl RedisCoordinator {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(unavailable)?;
        Ok(Self {
            conn,
            renew: redis::Script::new(RENEW_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

fn unavailable(e: redis::RedisError) -> SchedulerError {
    SchedulerError::LockUnavailable(e.to_string())
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn renew(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew
            .key(key)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted == 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unheld,
    Held,
}

/// One instance's view of the shared leadership lease.
pub struct LeaderLock {
    coordinator: Arc<dyn Coordinator>,
    key: String,
    token: String,
    ttl: Duration,
    state: LockState,
}

impl LeaderLock {
    pub fn new(coordinator: Arc<dyn Coordinator>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            coordinator,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl,
            state: LockState::Unheld,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == LockState::Held
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token identifying this instance as holder.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Try to become leader. A lease still held under our own token from an
    /// earlier term is picked up again.
    pub async fn acquire(&mut self) -> Result<bool> {
        let won = self
            .coordinator
            .set_if_absent(&self.key, &self.token, self.ttl)
            .await?
            || self
                .coordinator
                .renew(&self.key, &self.token, self.ttl)
                .await?;
        if won && self.state == LockState::Unheld {
            info!(key = %self.key, "leadership acquired");
        }
        self.state = if won { LockState::Held } else { LockState::Unheld };
        Ok(won)
    }

    /// Renew the lease. Returns false, and drops to `Unheld`, when the lease
    /// was lost. A coordinator error also drops to `Unheld`: leadership
    /// that cannot be confirmed is not exercised.
    pub async fn extend(&mut self) -> Result<bool> {
        if self.state == LockState::Unheld {
            return Ok(false);
        }
        match self.coordinator.renew(&self.key, &self.token, self.ttl).await {
            Ok(true) => {
                debug!(key = %self.key, "lease renewed");
                Ok(true)
            }
            Ok(false) => {
                warn!(key = %self.key, "leadership lost: lease expired or taken over");
                self.state = LockState::Unheld;
                Ok(false)
            }
            Err(e) => {
                self.state = LockState::Unheld;
                Err(e)
            }
        }
    }

    /// Give up leadership. No-op when not held.
    pub async fn release(&mut self) -> Result<()> {
        if self.state == LockState::Unheld {
            return Ok(());
        }
        self.state = LockState::Unheld;
        if self.coordinator.release(&self.key, &self.token).await? {
            info!(key = %self.key, "leadership released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    const TTL: Duration = Duration::from_secs(10);

    fn setup() -> (Arc<MemoryCoordinator>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (Arc::new(MemoryCoordinator::new(Arc::new(clock.clone()))), clock)
    }

    #[tokio::test]
    async fn only_one_instance_acquires() {
        let (coord, _) = setup();
        let mut a = LeaderLock::new(coord.clone(), "beat", TTL);
        let mut b = LeaderLock::new(coord.clone(), "beat", TTL);

        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());
        assert_eq!(a.state(), LockState::Held);
        assert_eq!(b.state(), LockState::Unheld);
        assert_eq!(coord.holder("beat").as_deref(), Some(a.token()));
    }

    #[tokio::test]
    async fn renewal_keeps_lease_alive() {
        let (coord, clock) = setup();
        let mut a = LeaderLock::new(coord.clone(), "beat", TTL);
        let mut b = LeaderLock::new(coord.clone(), "beat", TTL);
        a.acquire().await.unwrap();

        for _ in 0..5 {
            clock.advance(chrono::Duration::seconds(6));
            assert!(a.extend().await.unwrap());
            assert!(!b.acquire().await.unwrap());
        }
    }

    #[tokio::test]
    async fn crashed_leader_expires_after_ttl() {
        let (coord, clock) = setup();
        let mut a = LeaderLock::new(coord.clone(), "beat", TTL);
        let mut b = LeaderLock::new(coord.clone(), "beat", TTL);
        a.acquire().await.unwrap();

        clock.advance(chrono::Duration::seconds(9));
        assert!(!b.acquire().await.unwrap());
        clock.advance(chrono::Duration::seconds(1));
        assert!(b.acquire().await.unwrap());

        // The old leader notices on its next renewal.
        assert!(!a.extend().await.unwrap());
        assert_eq!(a.state(), LockState::Unheld);
    }

    #[tokio::test]
    async fn release_hands_over_immediately() {
        let (coord, _) = setup();
        let mut a = LeaderLock::new(coord.clone(), "beat", TTL);
        let mut b = LeaderLock::new(coord.clone(), "beat", TTL);
        a.acquire().await.unwrap();
        a.release().await.unwrap();
        assert!(!a.is_held());
        assert!(b.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn release_never_deletes_foreign_lease() {
        let (coord, clock) = setup();
        let mut a = LeaderLock::new(coord.clone(), "beat", TTL);
        let mut b = LeaderLock::new(coord.clone(), "beat", TTL);
        a.acquire().await.unwrap();
        clock.advance(chrono::Duration::seconds(11));
        b.acquire().await.unwrap();

        // `a` still believes it leads; its release must not touch b's lease.
        a.release().await.unwrap();
        assert_eq!(coord.holder("beat").as_deref(), Some(b.token()));
    }

    #[tokio::test]
    async fn reacquire_own_lease() {
        let (coord, _) = setup();
        let mut a = LeaderLock::new(coord.clone(), "beat", TTL);
        assert!(a.acquire().await.unwrap());
        assert!(a.acquire().await.unwrap());
        assert!(a.is_held());
    }
}
