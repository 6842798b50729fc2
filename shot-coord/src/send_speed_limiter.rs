use std::num::NonZeroU64;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;

use crate::clock;
use crate::clock::Clock;
use crate::error::CoordError;
use crate::error::Result;
use crate::script::SEND_SPEED;
use crate::store::Store;

const SECONDS_PER_PERIOD: i64 = 60;
const SECONDS_PER_DAY: i64 = 86_400;

/// Schedules batches so that no more than `rate_limit` units go out per
/// minute, carrying overflow into the following minute.
///
/// The limiter only advises: it returns the earliest time the batch may be
/// sent and never waits itself.
#[derive(Debug)]
pub struct SendSpeedLimiter<S>
where
    S: ?Sized,
{
    store: Arc<S>,
    rate_limit: NonZeroU64,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for SendSpeedLimiter<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            rate_limit: self.rate_limit,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> SendSpeedLimiter<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>, rate_limit: NonZeroU64) -> Self {
        Self {
            store,
            rate_limit,
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The earliest time a batch of `count` units for `identifier` may go out.
    pub async fn time_to_send(&self, identifier: &str, count: u64) -> Result<DateTime<Utc>> {
        let now = self.clock.now().timestamp();
        let current_minute = now - now.rem_euclid(SECONDS_PER_PERIOD);

        let args = [
            current_minute,
            i64::try_from(count).unwrap_or(i64::MAX),
            i64::try_from(self.rate_limit.get()).unwrap_or(i64::MAX),
            SECONDS_PER_PERIOD,
            SECONDS_PER_DAY,
        ];
        let send_at = self.store.eval(&SEND_SPEED, &keys(identifier), &args).await?;
        if send_at > current_minute {
            tracing::debug!(identifier, count, delay = send_at - current_minute, "batch deferred");
        }

        DateTime::from_timestamp(send_at, 0)
            .ok_or_else(|| CoordError::UnexpectedReply(format!("send time {send_at} out of range")))
    }

    /// Forgets the window state for `identifier`.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        let [next_key, count_key] = keys(identifier);
        self.store
            .del(&[next_key.as_str(), count_key.as_str()])
            .await?;
        Ok(())
    }
}

fn keys(identifier: &str) -> [String; 2] {
    [
        format!("time-rate-limit:timestamp:{identifier}"),
        format!("time-rate-limit:sent-count:{identifier}"),
    ]
}
