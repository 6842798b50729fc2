use std::sync::Arc;
use std::time::Duration;

use crate::clock;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::Batch;
use crate::store::SetOptions;
use crate::store::Store;

/// How [`FrequencyLock`] decides who wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireStrategy {
    /// `SET NX` with a ttl of the lock duration.
    #[default]
    SetIfAbsent,
    /// Read the timestamp; if it is absent or older than the duration,
    /// atomically swap in the current time and win only if the value
    /// swapped out was itself absent or stale.
    StaleAwareSwap,
}

/// A boolean mutex that lets one caller through per `duration`.
///
/// There is no unlock: the lock lapses when the duration does.
#[derive(Debug)]
pub struct FrequencyLock<S>
where
    S: ?Sized,
{
    store: Arc<S>,
    strategy: AcquireStrategy,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for FrequencyLock<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            strategy: self.strategy,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> FrequencyLock<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>, strategy: AcquireStrategy) -> Self {
        Self {
            store,
            strategy,
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attempts to take the lock called `name` for `duration`.
    ///
    /// Returns `false` if another caller holds it.
    pub async fn acquire(&self, name: &str, duration: Duration) -> Result<bool> {
        let acquired = match self.strategy {
            AcquireStrategy::SetIfAbsent => self.set_if_absent(name, duration).await?,
            AcquireStrategy::StaleAwareSwap => self.stale_aware_swap(name, duration).await?,
        };
        tracing::debug!(lock = name, acquired, "frequency lock");
        Ok(acquired)
    }

    async fn set_if_absent(&self, name: &str, duration: Duration) -> Result<bool> {
        let key = format!("{name}-set_lock");
        self.store
            .set(&key, "1", SetOptions::if_absent().with_ttl(duration))
            .await
    }

    async fn stale_aware_swap(&self, name: &str, duration: Duration) -> Result<bool> {
        let key = format!("{name}-getset_lock");
        let now = self.clock.now_millis();
        let stale_before = now - duration.as_millis() as i64;

        if !is_stale(self.store.get(&key).await?, stale_before) {
            return Ok(false);
        }

        // Many callers may get here; only the one that swaps out a stale
        // value wins.
        let batch = Batch::transaction()
            .getset(&key, now.to_string())
            .pexpire(&key, duration);
        let previous = self
            .store
            .exec(&batch)
            .await?
            .into_iter()
            .next()
            .map(|reply| reply.into_string())
            .transpose()?
            .flatten();

        Ok(is_stale(previous, stale_before))
    }
}

/// Unparseable values count as stale.
fn is_stale(value: Option<String>, stale_before: i64) -> bool {
    value
        .and_then(|value| value.parse::<i64>().ok())
        .is_none_or(|taken_at| taken_at < stale_before)
}
