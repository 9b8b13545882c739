use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long an accepted external id keeps blocking reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    FixedWindow(Duration),
    /// Blocks until the next local midnight after acceptance.
    UntilMidnight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    Fresh,
    Replayed,
}

/// Set of recently accepted login nonces keyed by external id.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    policy: ReplayPolicy,
    inner: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl ReplayGuard {
    pub fn new(policy: ReplayPolicy) -> Self {
        Self {
            policy,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn new_ttl(ttl_secs: u64) -> Self {
        Self::new(ReplayPolicy::FixedWindow(Duration::from_secs(ttl_secs)))
    }

    pub async fn check_and_reserve(&self, external_id: &str) -> ReplayVerdict {
        self.check_and_reserve_at(external_id, Utc::now()).await
    }

    /// Lookup and reservation happen under one lock; an expired entry is
    /// overwritten in place.
    pub async fn check_and_reserve_at(&self, external_id: &str, now: DateTime<Utc>) -> ReplayVerdict {
        let mut map = self.inner.lock().await;
        if let Some(expires_at) = map.get(external_id) {
            if now < *expires_at {
                return ReplayVerdict::Replayed;
            }
        }
        map.insert(external_id.to_string(), self.expiry_from(now));
        ReplayVerdict::Fresh
    }

    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.policy {
            ReplayPolicy::FixedWindow(ttl) => {
                now + TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::days(1))
            }
            ReplayPolicy::UntilMidnight => next_local_midnight(now),
        }
    }

    /// Drop every entry whose window has closed. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, expires_at| now < *expires_at);
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Periodically reclaim expired entries to bound memory.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = guard.purge_expired().await;
                if removed > 0 {
                    debug!(removed, "expired external ids reclaimed");
                }
            }
        })
    }
}

fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    local
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or_else(|| now + TimeDelta::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_fresh_then_replayed() {
        let guard = ReplayGuard::new_ttl(900);
        assert_eq!(guard.check_and_reserve("abc-123").await, ReplayVerdict::Fresh);
        assert_eq!(guard.check_and_reserve("abc-123").await, ReplayVerdict::Replayed);
        assert_eq!(guard.check_and_reserve("abc-124").await, ReplayVerdict::Fresh);
    }

    #[tokio::test]
    async fn test_replay_five_minutes_later_rejected() {
        let guard = ReplayGuard::new_ttl(15 * 60);
        let t0 = at("2024-01-01T10:00:00+00:00");
        assert_eq!(guard.check_and_reserve_at("abc-123", t0).await, ReplayVerdict::Fresh);
        let t5 = t0 + TimeDelta::minutes(5);
        assert_eq!(guard.check_and_reserve_at("abc-123", t5).await, ReplayVerdict::Replayed);
    }

    #[tokio::test]
    async fn test_expired_entry_reclaimed_on_lookup() {
        let guard = ReplayGuard::new_ttl(60);
        let t0 = at("2024-01-01T10:00:00+00:00");
        assert_eq!(guard.check_and_reserve_at("abc-123", t0).await, ReplayVerdict::Fresh);
        assert_eq!(
            guard.check_and_reserve_at("abc-123", t0 + TimeDelta::seconds(59)).await,
            ReplayVerdict::Replayed
        );
        assert_eq!(
            guard.check_and_reserve_at("abc-123", t0 + TimeDelta::seconds(60)).await,
            ReplayVerdict::Fresh
        );
        assert_eq!(guard.len().await, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let guard = ReplayGuard::new_ttl(60);
        let t0 = at("2024-01-01T10:00:00+00:00");
        guard.check_and_reserve_at("a", t0).await;
        guard.check_and_reserve_at("b", t0 + TimeDelta::seconds(30)).await;
        assert_eq!(guard.purge_expired_at(t0 + TimeDelta::seconds(61)).await, 1);
        assert_eq!(guard.len().await, 1);
        assert_eq!(guard.purge_expired_at(t0 + TimeDelta::seconds(91)).await, 1);
        assert!(guard.is_empty().await);
    }

    #[test]
    fn test_midnight_policy_expiry() {
        let guard = ReplayGuard::new(ReplayPolicy::UntilMidnight);
        let now = Utc::now();
        let expires = guard.expiry_from(now);
        assert!(expires > now);
        assert!(expires <= now + TimeDelta::hours(25));
        let local = expires.with_timezone(&Local);
        assert_eq!(local.date_naive(), now.with_timezone(&Local).date_naive().succ_opt().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_single_winner() {
        let guard = ReplayGuard::new_ttl(900);
        let mut handles = Vec::new();
        for _ in 0..32 {
            let g = guard.clone();
            handles.push(tokio::spawn(async move { g.check_and_reserve("race-id").await }));
        }
        let mut fresh = 0;
        for h in handles {
            if h.await.unwrap() == ReplayVerdict::Fresh {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }
}
