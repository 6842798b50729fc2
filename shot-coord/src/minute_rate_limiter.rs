use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

use crate::clock;
use crate::clock::Clock;
use crate::error::CoordError;
use crate::error::Result;
use crate::store::Batch;
use crate::store::Store;

const BUCKET_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
struct MinuteRateLimiterMetrics {
    limited: Counter<u64>,
}

/// A fixed-window limiter: at most `per_minute_limit` calls per identifier
/// per UTC calendar minute.
///
/// Each identifier/minute pair gets its own counter which expires a minute
/// after its last use.
#[derive(Debug)]
pub struct MinuteRateLimiter<S>
where
    S: ?Sized,
{
    store: Arc<S>,
    per_minute_limit: NonZeroU64,
    clock: Arc<dyn Clock>,
    instruments: MinuteRateLimiterMetrics,
}

impl<S> Clone for MinuteRateLimiter<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            per_minute_limit: self.per_minute_limit,
            clock: Arc::clone(&self.clock),
            instruments: self.instruments.clone(),
        }
    }
}

impl<S> MinuteRateLimiter<S>
where
    S: Store + ?Sized,
{
    pub const DEFAULT_LIMIT: NonZeroU64 = NonZeroU64::new(5).unwrap();

    pub fn new(store: Arc<S>, per_minute_limit: NonZeroU64) -> Self {
        let meter = global::meter("minute_rate_limiter");
        let instruments = MinuteRateLimiterMetrics {
            limited: meter.u64_counter("limited").build(),
        };

        Self {
            store,
            per_minute_limit,
            clock: clock::system(),
            instruments,
        }
    }

    pub fn with_default_limit(store: Arc<S>) -> Self {
        Self::new(store, Self::DEFAULT_LIMIT)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Counts a call for `identifier` and reports whether it is over the limit.
    ///
    /// The call that brings the minute's count to the limit is already
    /// limited.
    pub async fn should_limit(&self, identifier: &str) -> Result<bool> {
        let key = self.key(identifier);
        let batch = Batch::transaction()
            .incr_by(&key, 1)
            .pexpire(&key, BUCKET_TTL);
        let count = self
            .store
            .exec(&batch)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CoordError::UnexpectedReply("empty reply to rate limit transaction".to_string())
            })?
            .into_int()?;

        let limited = count >= self.per_minute_limit.get() as i64;
        if limited {
            tracing::info!(identifier, count, "over per-minute rate limit");
            self.instruments
                .limited
                .add(1, &[KeyValue::new("identifier", identifier.to_string())]);
        }
        Ok(limited)
    }

    /// Calls left for `identifier` this minute.
    ///
    /// This is a plain read, racing any concurrent [`should_limit`](Self::should_limit);
    /// use it for reporting, never for admission.
    pub async fn remaining(&self, identifier: &str) -> Result<u64> {
        let count = self
            .store
            .get(&self.key(identifier))
            .await?
            .and_then(|count| count.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(self.per_minute_limit.get().saturating_sub(count))
    }

    fn key(&self, identifier: &str) -> String {
        let minute = self.clock.now().format("%Y-%m-%d-%H-%M");
        format!("rate_limit:{identifier}:{minute}")
    }
}
