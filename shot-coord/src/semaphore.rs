use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

use crate::clock;
use crate::clock::Clock;
use crate::error::CoordError;
use crate::error::Result;
use crate::script::CREATE_POOL;
use crate::script::RELEASE_LEASE;
use crate::store::Batch;
use crate::store::Reply;
use crate::store::SetOptions;
use crate::store::Store;

/// Default lifetime of the reclamation guard, and so the minimum time between
/// two reclamation passes across all clients.
pub const DEFAULT_STALE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// One of the `resource_count` interchangeable resources of a [`Semaphore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceToken(usize);

impl ResourceToken {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResourceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The result of [`Semaphore::lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum LockOutcome<R> {
    /// A token was leased and the body ran to completion, returning `R`.
    Acquired(R),
    /// No token became free in time; the body never ran.
    NotAcquired,
}

impl<R> LockOutcome<R> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }

    pub fn acquired(self) -> Option<R> {
        match self {
            LockOutcome::Acquired(value) => Some(value),
            LockOutcome::NotAcquired => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PoolKeys {
    available: String,
    taken: String,
    created: String,
    stale_mutex: String,
}

impl PoolKeys {
    fn new(name: &str) -> Self {
        Self {
            available: format!("semaphore:{name}:list"),
            taken: format!("semaphore:{name}:taken"),
            created: format!("semaphore:{name}:created"),
            stale_mutex: format!("semaphore:{name}:stale_mutex"),
        }
    }

    fn pool(&self) -> [String; 3] {
        [
            self.available.clone(),
            self.taken.clone(),
            self.created.clone(),
        ]
    }
}

#[derive(Clone, Debug)]
struct SemaphoreMetrics {
    not_acquired: Counter<u64>,
    stale_released: Counter<u64>,
}

/// A counting semaphore shared by every process using the same store and
/// name.
///
/// The pool is created lazily with tokens `1..=resource_count`. Three keys
/// hold it: a list of available tokens, a hash of leased token to lease time,
/// and a creation marker. All three expire `expiration` after the last lease
/// was granted; an expired pool is recreated in full on next use.
///
/// A holder that dies without releasing keeps its token until either the pool
/// expires or, when a stale client timeout is configured, a later
/// [`lock`](Self::lock) reclaims it.
#[derive(Debug)]
pub struct Semaphore<S>
where
    S: ?Sized,
{
    store: Arc<S>,
    name: String,
    resource_count: NonZeroUsize,
    expiration: Duration,
    stale_client_timeout: Option<Duration>,
    stale_check_interval: Duration,
    clock: Arc<dyn Clock>,
    keys: PoolKeys,
    instruments: SemaphoreMetrics,
}

impl<S> Clone for Semaphore<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            resource_count: self.resource_count,
            expiration: self.expiration,
            stale_client_timeout: self.stale_client_timeout,
            stale_check_interval: self.stale_check_interval,
            clock: Arc::clone(&self.clock),
            keys: self.keys.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

impl<S> Semaphore<S>
where
    S: Store + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        name: impl Into<String>,
        resource_count: NonZeroUsize,
        expiration: Duration,
    ) -> Self {
        let name = name.into();
        let meter = global::meter("semaphore");
        let instruments = SemaphoreMetrics {
            not_acquired: meter.u64_counter("not_acquired").build(),
            stale_released: meter.u64_counter("stale_released").build(),
        };

        Self {
            store,
            keys: PoolKeys::new(&name),
            name,
            resource_count,
            expiration,
            stale_client_timeout: None,
            stale_check_interval: DEFAULT_STALE_CHECK_INTERVAL,
            clock: clock::system(),
            instruments,
        }
    }

    /// Reclaim leases older than `timeout` before each acquisition.
    pub fn with_stale_client_timeout(mut self, timeout: Duration) -> Self {
        self.stale_client_timeout = Some(timeout);
        self
    }

    /// Set the minimum time between reclamation passes across all clients.
    pub fn with_stale_check_interval(mut self, interval: Duration) -> Self {
        self.stale_check_interval = interval;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_count(&self) -> NonZeroUsize {
        self.resource_count
    }

    /// Tokens currently free. A pool that does not exist yet counts as full.
    pub async fn available_count(&self) -> Result<usize> {
        let batch = Batch::pipeline()
            .exists(&self.keys.created)
            .llen(&self.keys.available);
        let mut replies = self.store.exec(&batch).await?.into_iter();

        let exists = replies
            .next()
            .map(Reply::into_bool)
            .transpose()?
            .unwrap_or(false);
        if !exists {
            return Ok(self.resource_count.get());
        }
        let length = replies.next().map(Reply::into_int).transpose()?.unwrap_or(0);
        Ok(length.max(0) as usize)
    }

    /// Leases a token, runs `body` with it, and releases it.
    ///
    /// Without a `timeout` this does not wait for a token; with one it waits
    /// up to `timeout` for another holder to release. The token is released
    /// however `body` ends: by completing, by panicking (the panic resumes
    /// after the release), or by this future being dropped.
    pub async fn lock<F, Fut, R>(&self, timeout: Option<Duration>, body: F) -> Result<LockOutcome<R>>
    where
        F: FnOnce(ResourceToken) -> Fut,
        Fut: Future<Output = R>,
    {
        self.create_if_not_exists().await?;
        if self.stale_client_timeout.is_some() {
            self.release_stale_locks().await?;
        }

        let Some(token) = self.pop(timeout).await? else {
            tracing::debug!(semaphore = %self.name, "no resource available");
            self.instruments
                .not_acquired
                .add(1, &[KeyValue::new("semaphore", self.name.clone())]);
            return Ok(LockOutcome::NotAcquired);
        };

        // From here on the token goes back even if we fail or are dropped
        let mut lease = Lease {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            token,
            granted: false,
            released: false,
        };
        self.grant(token).await?;
        lease.granted = true;
        tracing::debug!(semaphore = %self.name, %token, "resource leased");

        let outcome = AssertUnwindSafe(body(token)).catch_unwind().await;
        let released = lease.release().await;

        match outcome {
            Ok(value) => {
                released?;
                Ok(LockOutcome::Acquired(value))
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Removes the pool outright, whoever holds tokens. The next use
    /// recreates it in full.
    pub async fn delete(&self) -> Result<()> {
        self.store
            .del(&[
                self.keys.available.as_str(),
                self.keys.taken.as_str(),
                self.keys.created.as_str(),
            ])
            .await?;
        Ok(())
    }

    /// Creates the pool unless it exists. Exactly one of any number of
    /// concurrent callers creates it.
    ///
    /// Returns whether this call created it.
    pub async fn create_if_not_exists(&self) -> Result<bool> {
        let args = [
            self.resource_count.get() as i64,
            self.expiration.as_millis() as i64,
            self.clock.now_millis(),
        ];
        let created = self
            .store
            .eval(&CREATE_POOL, &self.keys.pool(), &args)
            .await?
            == 1;
        if created {
            tracing::debug!(
                semaphore = %self.name,
                resources = self.resource_count.get(),
                "pool created"
            );
        }
        Ok(created)
    }

    /// Returns leases held longer than the stale client timeout to the pool.
    ///
    /// At most one client runs a pass per check interval, and none does
    /// until the pool is at least one timeout old. Returns how many leases
    /// this call released.
    pub async fn release_stale_locks(&self) -> Result<usize> {
        let Some(stale_client_timeout) = self.stale_client_timeout else {
            return Ok(0);
        };
        let stale_after = stale_client_timeout.as_millis() as i64;

        // A missing marker reads as the epoch, so the pass goes ahead
        let created_at = self
            .store
            .get(&self.keys.created)
            .await?
            .and_then(|created_at| created_at.parse::<i64>().ok())
            .unwrap_or(0);
        if created_at + stale_after > self.clock.now_millis() {
            return Ok(0);
        }

        let guard = SetOptions::if_absent().with_ttl(self.stale_check_interval);
        if !self.store.set(&self.keys.stale_mutex, "1", guard).await? {
            return Ok(0);
        }

        let taken = self.store.hgetall(&self.keys.taken).await?;
        let now = self.clock.now_millis();
        let mut released = 0;
        for (token, locked_at) in taken {
            let locked_at = locked_at.parse::<i64>().unwrap_or(0);
            if locked_at + stale_after >= now {
                continue;
            }
            let Ok(token) = token.parse().map(ResourceToken) else {
                tracing::warn!(semaphore = %self.name, %token, "ignoring malformed lease");
                continue;
            };

            tracing::warn!(
                semaphore = %self.name,
                %token,
                held_ms = now - locked_at,
                "releasing stale lease"
            );
            if release_lease(&*self.store, &self.keys, token, true).await? {
                released += 1;
                self.instruments
                    .stale_released
                    .add(1, &[KeyValue::new("semaphore", self.name.clone())]);
            }
        }
        Ok(released)
    }

    async fn pop(&self, timeout: Option<Duration>) -> Result<Option<ResourceToken>> {
        let popped = match timeout {
            Some(timeout) if !timeout.is_zero() => {
                self.store.brpop(&self.keys.available, timeout).await?
            }
            _ => self.store.rpop(&self.keys.available).await?,
        };
        popped
            .map(|token| {
                token.parse().map(ResourceToken).map_err(|_| {
                    CoordError::UnexpectedReply(format!(
                        "semaphore {} holds malformed token {token:?}",
                        self.name
                    ))
                })
            })
            .transpose()
    }

    /// Records the lease and keeps the whole pool alive for another
    /// expiration period.
    async fn grant(&self, token: ResourceToken) -> Result<()> {
        let batch = Batch::transaction()
            .hset(
                &self.keys.taken,
                token.to_string(),
                self.clock.now_millis().to_string(),
            )
            .pexpire(&self.keys.available, self.expiration)
            .pexpire(&self.keys.taken, self.expiration)
            .pexpire(&self.keys.created, self.expiration);
        self.store.exec(&batch).await?;
        Ok(())
    }
}

/// Returns `token` to the pool. A token that was never `granted` has no
/// lease record, so it is pushed back without one.
async fn release_lease<S>(
    store: &S,
    keys: &PoolKeys,
    token: ResourceToken,
    granted: bool,
) -> Result<bool>
where
    S: Store + ?Sized,
{
    let args = [token.get() as i64, i64::from(!granted)];
    let released = store.eval(&RELEASE_LEASE, &keys.pool(), &args).await?;
    Ok(released == 1)
}

/// A leased token that goes back to the pool when dropped unreleased.
struct Lease<S>
where
    S: Store + ?Sized + 'static,
{
    store: Arc<S>,
    keys: PoolKeys,
    token: ResourceToken,
    granted: bool,
    released: bool,
}

impl<S> Lease<S>
where
    S: Store + ?Sized + 'static,
{
    async fn release(mut self) -> Result<bool> {
        let released = release_lease(&*self.store, &self.keys, self.token, self.granted).await?;
        self.released = true;
        tracing::debug!(token = %self.token, "resource released");
        Ok(released)
    }
}

impl<S> Drop for Lease<S>
where
    S: Store + ?Sized + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let keys = self.keys.clone();
        let token = self.token;
        let granted = self.granted;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(%token, "releasing abandoned lease");
                handle.spawn(async move {
                    if let Err(err) = release_lease(&*store, &keys, token, granted).await {
                        tracing::warn!(%token, %err, "failed to release abandoned lease");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%token, "no runtime to release abandoned lease; it will go stale");
            }
        }
    }
}
