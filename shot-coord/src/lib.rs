//! # shot-coord
//!
//! `shot-coord` provides coordination primitives for processes that share
//! nothing but a key-value store with atomic operations, typically Redis.
//!
//! ## Core Philosophy
//!
//! No primitive keeps state in process memory. Every decision is made by one
//! atomic store operation: a single command, a `MULTI/EXEC` transaction, or a
//! server-side script. Any number of processes can therefore use the same
//! primitive under the same name and get consistent answers. All state carries
//! a TTL, so an abandoned name cleans itself up.
//!
//! ## Primitives
//!
//! * [`FrequencyLock`]: at most one caller per name per duration.
//! * [`MinuteRateLimiter`]: at most N calls per identifier per UTC minute.
//! * [`SendVolumeLimiter`]: a lifetime cap on units sent per identifier.
//! * [`SendSpeedLimiter`]: when a batch may go out under a per-minute rate.
//! * [`Semaphore`]: N leasable tokens with stale lease reclamation.
//!
//! ## Example
//!
//! ```rust
//! use std::num::NonZeroUsize;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shot_coord::LockOutcome;
//! use shot_coord::Semaphore;
//! use shot_coord::store::MemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> shot_coord::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let semaphore = Semaphore::new(
//!     store,
//!     "exports",
//!     NonZeroUsize::new(2).unwrap(),
//!     Duration::from_secs(300),
//! );
//!
//! let outcome = semaphore
//!     .lock(None, |token| async move { format!("exporting with {token}") })
//!     .await?;
//! assert!(matches!(outcome, LockOutcome::Acquired(_)));
//! # Ok(())
//! # }
//! ```

pub mod clock;
mod error;
mod frequency_lock;
mod minute_rate_limiter;
pub mod script;
mod semaphore;
mod send_speed_limiter;
mod send_volume_limiter;
pub mod store;

pub use error::CoordError;
pub use error::Result;
pub use frequency_lock::AcquireStrategy;
pub use frequency_lock::FrequencyLock;
pub use minute_rate_limiter::MinuteRateLimiter;
pub use semaphore::DEFAULT_STALE_CHECK_INTERVAL;
pub use semaphore::LockOutcome;
pub use semaphore::ResourceToken;
pub use semaphore::Semaphore;
pub use send_speed_limiter::SendSpeedLimiter;
pub use send_volume_limiter::SendVolumeLimiter;
pub use store::Store;

#[cfg(test)]
mod tests;
