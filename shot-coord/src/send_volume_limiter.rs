use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

use crate::error::Result;
use crate::store::Store;

#[derive(Clone, Debug)]
struct SendVolumeLimiterMetrics {
    dropped: Counter<u64>,
}

/// Caps the lifetime total of units sent per identifier.
///
/// A batch that does not fit is cut down to the headroom that was left
/// before it; the rest is dropped. The total only goes back to zero through
/// [`reset`](Self::reset).
#[derive(Debug)]
pub struct SendVolumeLimiter<S>
where
    S: ?Sized,
{
    store: Arc<S>,
    cap: u64,
    instruments: SendVolumeLimiterMetrics,
}

impl<S> Clone for SendVolumeLimiter<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cap: self.cap,
            instruments: self.instruments.clone(),
        }
    }
}

impl<S> SendVolumeLimiter<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>, cap: u64) -> Self {
        let meter = global::meter("send_volume_limiter");
        let instruments = SendVolumeLimiterMetrics {
            dropped: meter.u64_counter("dropped").build(),
        };

        Self {
            store,
            cap,
            instruments,
        }
    }

    /// Admits the longest prefix of `batch` that fits under the cap.
    pub async fn admit<'a, T>(&self, identifier: &str, batch: &'a [T]) -> Result<&'a [T]> {
        let total = self
            .store
            .incr_by(&key(identifier), batch.len() as i64)
            .await?;
        let admitted = admitted_len(total, batch.len(), self.cap);

        if admitted < batch.len() {
            let dropped = batch.len() - admitted;
            tracing::info!(identifier, total, admitted, dropped, "send volume cap reached");
            self.instruments.dropped.add(
                dropped as u64,
                &[KeyValue::new("identifier", identifier.to_string())],
            );
        }
        Ok(&batch[..admitted])
    }

    /// Forgets everything `identifier` has sent.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        self.store.del(&[key(identifier).as_str()]).await?;
        Ok(())
    }
}

fn key(identifier: &str) -> String {
    format!("volume:{identifier}")
}

/// How much of a batch of `batch_len` fits, given the running total after
/// adding it.
fn admitted_len(total: i64, batch_len: usize, cap: u64) -> usize {
    let cap = i64::try_from(cap).unwrap_or(i64::MAX);
    if total <= cap {
        return batch_len;
    }
    let before = total - batch_len as i64;
    let headroom = cap.saturating_sub(before).max(0);
    (headroom as usize).min(batch_len)
}
