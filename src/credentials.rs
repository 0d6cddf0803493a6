/*!
 * Credential lifecycle for storage backends
 *
 * [`CredentialManager`] is constructed once and shared by every transfer.
 * Leases are cached per [`StorageContext`]. The cache map sits behind a
 * synchronous mutex that is only ever held for in-memory reads and writes;
 * issuance happens outside it. Concurrent callers that miss the cache for the
 * same context queue on a per-context async gate and re-check the cache once
 * they get through, so exactly one of them talks to the issuer.
 *
 * Leases are renewed `refresh_ahead` before they expire, both on demand and
 * by an optional background refresher.
 */

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CredentialConfig, RetryConfig};
use crate::core::rate_limit::{ApiRateLimiter, RequestClass};
use crate::core::retry::RetryPolicy;
use crate::error::{ParsecError, Result};
use crate::remote::CredentialIssuer;

pub use crate::remote::StorageContext;

/// Time-bounded storage credentials for one backend
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialLease {
    pub context: StorageContext,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Issuer-assigned sequence number
    pub serial: u64,
}

impl CredentialLease {
    /// Time left before expiry (zero once expired)
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// Whether the lease is still good for at least `margin`
    pub fn valid_for(&self, margin: Duration) -> bool {
        self.remaining() > margin
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("context", &self.context)
            .field("access_key_id", &self.access_key_id)
            .field("expires_at", &self.expires_at)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// Shared, self-refreshing lease cache
pub struct CredentialManager {
    issuer: Arc<dyn CredentialIssuer>,
    limiter: Arc<ApiRateLimiter>,
    retry: RetryPolicy,
    refresh_ahead: Duration,
    cache: Mutex<HashMap<StorageContext, Arc<CredentialLease>>>,
    gates: Mutex<HashMap<StorageContext, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialManager {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        limiter: Arc<ApiRateLimiter>,
        config: &CredentialConfig,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            issuer,
            limiter,
            retry: RetryPolicy::new(config.refresh_attempts, retry.backoff()),
            refresh_ahead: config.refresh_ahead(),
            cache: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Lease for `context`, issuing or renewing one if needed
    pub async fn get(
        &self,
        context: &StorageContext,
        cancel: &CancellationToken,
    ) -> Result<Arc<CredentialLease>> {
        if let Some(lease) = self.cached_fresh(context) {
            return Ok(lease);
        }

        let gate = self.gate(context);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ParsecError::Cancelled),
            guard = gate.lock() => guard,
        };

        // Another caller may have refreshed while we waited on the gate
        if let Some(lease) = self.cached_fresh(context) {
            return Ok(lease);
        }

        match self.issue_and_store(context, cancel).await {
            Ok(lease) => Ok(lease),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                // A lease inside the refresh-ahead window is still usable until it expires
                let current = self.cache.lock().get(context).cloned();
                match current {
                    Some(lease) if !lease.is_expired() => {
                        warn!(
                            storage = %context,
                            serial = lease.serial,
                            remaining_secs = lease.remaining().as_secs(),
                            error = %e,
                            "lease renewal failed, keeping current lease"
                        );
                        Ok(lease)
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// Drop `stale` from the cache after the backend rejected it
    ///
    /// A lease that was already replaced by a newer one is left alone.
    pub fn invalidate(&self, context: &StorageContext, stale: &CredentialLease) {
        let mut cache = self.cache.lock();
        if let Some(current) = cache.get(context) {
            if current.serial == stale.serial && current.access_key_id == stale.access_key_id {
                cache.remove(context);
                debug!(storage = %context, serial = stale.serial, "credential lease invalidated");
            }
        }
    }

    /// Renew every cached lease that expires within `window`
    pub async fn refresh_expiring(&self, window: Duration, cancel: &CancellationToken) -> usize {
        let due: Vec<StorageContext> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(_, lease)| !lease.valid_for(window))
                .map(|(context, _)| context.clone())
                .collect()
        };

        let mut renewed = 0;
        for context in due {
            let gate = self.gate(&context);
            let _guard = gate.lock().await;

            // Skip if a caller already renewed it while we waited
            let still_due = self
                .cache
                .lock()
                .get(&context)
                .map(|lease| !lease.valid_for(window))
                .unwrap_or(false);
            if !still_due {
                continue;
            }

            match self.issue_and_store(&context, cancel).await {
                Ok(_) => renewed += 1,
                Err(e) if e.is_cancelled() => break,
                Err(e) => warn!(storage = %context, error = %e, "background lease refresh failed"),
            }
        }
        renewed
    }

    /// Periodically renew leases before they expire
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let window = self.refresh_ahead + interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let renewed = manager.refresh_expiring(window, &cancel).await;
                        if renewed > 0 {
                            debug!(renewed, "credential refresher renewed leases");
                        }
                    }
                }
            }
            debug!("credential refresher stopped");
        })
    }

    /// Number of cached leases
    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }

    fn cached_fresh(&self, context: &StorageContext) -> Option<Arc<CredentialLease>> {
        self.cache
            .lock()
            .get(context)
            .filter(|lease| lease.valid_for(self.refresh_ahead))
            .cloned()
    }

    fn gate(&self, context: &StorageContext) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .entry(context.clone())
            .or_default()
            .clone()
    }

    async fn issue_and_store(
        &self,
        context: &StorageContext,
        cancel: &CancellationToken,
    ) -> Result<Arc<CredentialLease>> {
        let limiter = &self.limiter;
        let issuer = &self.issuer;
        let lease = self
            .retry
            .run("issue_credentials", cancel, move |_| async move {
                limiter.acquire(RequestClass::General, cancel).await?;
                issuer.issue(context).await
            })
            .await
            .map_err(|e| e.context(format!("cannot obtain credentials for {}", context)))?;

        let lease = Arc::new(lease);
        info!(
            storage = %context,
            serial = lease.serial,
            expires_at = %lease.expires_at,
            "credential lease issued"
        );
        self.cache.lock().insert(context.clone(), Arc::clone(&lease));
        Ok(lease)
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("refresh_ahead", &self.refresh_ahead)
            .field("cached", &self.cached_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    struct CountingIssuer {
        issued: AtomicU64,
        fail_first: AtomicU32,
        ttl: chrono::Duration,
    }

    impl CountingIssuer {
        fn new(ttl: chrono::Duration) -> Self {
            Self {
                issued: AtomicU64::new(0),
                fail_first: AtomicU32::new(0),
                ttl,
            }
        }
    }

    #[async_trait]
    impl CredentialIssuer for CountingIssuer {
        async fn issue(&self, context: &StorageContext) -> Result<CredentialLease> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ParsecError::TransientNetwork("issuer unavailable".into()));
            }
            let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CredentialLease {
                context: context.clone(),
                access_key_id: format!("AK{serial}"),
                secret_access_key: "secret".into(),
                session_token: None,
                expires_at: Utc::now() + self.ttl,
                serial,
            })
        }
    }

    fn manager(issuer: Arc<CountingIssuer>) -> Arc<CredentialManager> {
        let limiter = Arc::new(ApiRateLimiter::new(&RateLimitConfig::default()).unwrap());
        let config = CredentialConfig {
            refresh_interval_secs: 600,
            refresh_ahead_secs: 60,
            refresh_attempts: 3,
        };
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        Arc::new(CredentialManager::new(issuer, limiter, &config, &retry))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_issue() {
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::hours(1)));
        let manager = manager(issuer.clone());
        let context = StorageContext::new("memory", "a");
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let context = context.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                manager.get(&context, &cancel).await.unwrap().serial
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }
        assert_eq!(issuer.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_leases_are_scoped_per_storage() {
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::hours(1)));
        let manager = manager(issuer.clone());
        let cancel = CancellationToken::new();

        let a = manager
            .get(&StorageContext::new("memory", "a"), &cancel)
            .await
            .unwrap();
        let b = manager
            .get(&StorageContext::new("archive", "a"), &cancel)
            .await
            .unwrap();
        assert_ne!(a.serial, b.serial);
        assert_eq!(manager.cached_count(), 2);
    }

    #[tokio::test]
    async fn test_nearly_expired_lease_is_renewed() {
        // Lifetime shorter than the 60s refresh-ahead window
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::seconds(30)));
        let manager = manager(issuer.clone());
        let context = StorageContext::new("memory", "a");
        let cancel = CancellationToken::new();

        let first = manager.get(&context, &cancel).await.unwrap();
        let second = manager.get(&context, &cancel).await.unwrap();
        assert_ne!(first.serial, second.serial);
    }

    #[tokio::test]
    async fn test_invalidate_only_drops_matching_lease() {
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::hours(1)));
        let manager = manager(issuer.clone());
        let context = StorageContext::new("memory", "a");
        let cancel = CancellationToken::new();

        let first = manager.get(&context, &cancel).await.unwrap();
        manager.invalidate(&context, &first);
        let second = manager.get(&context, &cancel).await.unwrap();
        assert_eq!(second.serial, 2);

        // A late invalidation with the old lease must not evict the new one
        manager.invalidate(&context, &first);
        let third = manager.get(&context, &cancel).await.unwrap();
        assert_eq!(third.serial, 2);
    }

    #[tokio::test]
    async fn test_issue_failures_are_retried() {
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::hours(1)));
        issuer.fail_first.store(2, Ordering::SeqCst);
        let manager = manager(issuer.clone());

        let lease = manager
            .get(&StorageContext::new("memory", "a"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(lease.serial, 1);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_unexpired_lease() {
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::seconds(30)));
        let manager = manager(issuer.clone());
        let context = StorageContext::new("memory", "a");
        let cancel = CancellationToken::new();

        let first = manager.get(&context, &cancel).await.unwrap();
        issuer.fail_first.store(100, Ordering::SeqCst);

        // Inside the refresh-ahead window, but not yet expired
        let second = manager.get(&context, &cancel).await.unwrap();
        assert_eq!(second.serial, first.serial);
        assert_eq!(issuer.issued.load(Ordering::SeqCst), 1);

        // Once the issuer recovers the next call renews it
        issuer.fail_first.store(0, Ordering::SeqCst);
        let third = manager.get(&context, &cancel).await.unwrap();
        assert_eq!(third.serial, 2);
    }

    #[tokio::test]
    async fn test_failed_renewal_of_expired_lease_is_an_error() {
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::seconds(-1)));
        let manager = manager(issuer.clone());
        let context = StorageContext::new("memory", "a");
        let cancel = CancellationToken::new();

        manager.get(&context, &cancel).await.unwrap();
        issuer.fail_first.store(100, Ordering::SeqCst);
        assert!(manager.get(&context, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_refresher_renews_before_expiry() {
        let issuer = Arc::new(CountingIssuer::new(chrono::Duration::seconds(90)));
        let manager = manager(issuer.clone());
        let context = StorageContext::new("memory", "a");
        let cancel = CancellationToken::new();
        manager.get(&context, &cancel).await.unwrap();

        // 90s left is outside the 60s refresh-ahead window but inside 120s
        assert_eq!(manager.refresh_expiring(Duration::from_secs(120), &cancel).await, 1);
        assert_eq!(issuer.issued.load(Ordering::SeqCst), 2);

        let handle = manager.spawn_refresher(Duration::from_millis(50), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_debug_hides_secret() {
        let lease = CredentialLease {
            context: StorageContext::new("memory", "a"),
            access_key_id: "AK1".into(),
            secret_access_key: "very-secret".into(),
            session_token: Some("token".into()),
            expires_at: Utc::now(),
            serial: 1,
        };
        let text = format!("{:?}", lease);
        assert!(!text.contains("very-secret"));
        assert!(lease.is_expired());
    }
}
