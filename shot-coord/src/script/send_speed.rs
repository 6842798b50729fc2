use std::time::Duration;

use super::Script;
use super::exactly;
use crate::error::Result;
use crate::store::Keyspace;
use crate::store::SetOptions;

/// Computes when a batch may be sent under a sliding window with carry.
///
/// KEYS: `[next_allowed_time, sent_count]`
/// ARGV: `[requested_time, count, rate_limit, period_secs, ttl_secs]`
///
/// Times are unix seconds. Returns the time at which the batch may be sent.
pub static SEND_SPEED: Script = Script::new("send_speed", LUA, transition);

const LUA: &str = r#"
local requested_time = tonumber(ARGV[1])
local count = tonumber(ARGV[2])
local rate_limit = tonumber(ARGV[3])
local period = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local next_time = 0
local stored = redis.call('GET', KEYS[1])
if stored then
  next_time = tonumber(stored)
end
if next_time < requested_time then
  redis.call('SET', KEYS[1], requested_time)
  redis.call('SET', KEYS[2], count)
  redis.call('EXPIRE', KEYS[1], ttl)
  redis.call('EXPIRE', KEYS[2], ttl)
  return requested_time
end
local total_sent = redis.call('INCRBY', KEYS[2], count)
if total_sent > rate_limit then
  next_time = next_time + period
  redis.call('SET', KEYS[1], next_time)
  redis.call('SET', KEYS[2], count)
end
redis.call('EXPIRE', KEYS[1], ttl)
redis.call('EXPIRE', KEYS[2], ttl)
return next_time
"#;

fn transition(keys: &mut dyn Keyspace, key_names: &[String], args: &[i64]) -> Result<i64> {
    let [next_key, count_key] = exactly::<_, 2>(SEND_SPEED.name, "keys", key_names)?;
    let [requested_time, count, rate_limit, period, ttl] =
        *exactly::<_, 5>(SEND_SPEED.name, "arguments", args)?;
    let ttl = Duration::from_secs(ttl.max(0) as u64);

    // An unparseable stored time reads as unset, as tonumber() would
    let mut next_time = keys
        .get(next_key)?
        .and_then(|stored| stored.parse::<i64>().ok())
        .unwrap_or(0);

    if next_time < requested_time {
        keys.set(next_key, &requested_time.to_string(), SetOptions::default())?;
        keys.set(count_key, &count.to_string(), SetOptions::default())?;
        keys.pexpire(next_key, ttl);
        keys.pexpire(count_key, ttl);
        return Ok(requested_time);
    }

    let total_sent = keys.incr_by(count_key, count)?;
    if total_sent > rate_limit {
        // One period per call, however far the batch overflows
        next_time += period;
        keys.set(next_key, &next_time.to_string(), SetOptions::default())?;
        keys.set(count_key, &count.to_string(), SetOptions::default())?;
    }
    keys.pexpire(next_key, ttl);
    keys.pexpire(count_key, ttl);
    Ok(next_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyspace;

    const T0: i64 = 1_700_000_040;

    fn names() -> Vec<String> {
        ["speed:next", "speed:count"].map(String::from).to_vec()
    }

    fn schedule(keys: &mut MemoryKeyspace, requested: i64, count: i64) -> i64 {
        SEND_SPEED
            .run(keys, &names(), &[requested, count, 100, 60, 86_400])
            .unwrap()
    }

    #[test]
    fn overflow_moves_to_next_window() {
        let mut keys = MemoryKeyspace::new();
        keys.at(T0 * 1000);

        assert_eq!(schedule(&mut keys, T0, 60), T0);
        assert_eq!(schedule(&mut keys, T0, 50), T0 + 60);

        // The overflowing batch opened the new window
        assert_eq!(keys.get("speed:count").unwrap().as_deref(), Some("50"));
        assert_eq!(keys.get("speed:next").unwrap().as_deref(), Some("1700000100"));
    }

    #[test]
    fn batches_fit_until_the_limit() {
        let mut keys = MemoryKeyspace::new();
        keys.at(T0 * 1000);

        assert_eq!(schedule(&mut keys, T0, 40), T0);
        assert_eq!(schedule(&mut keys, T0, 60), T0);
        assert_eq!(keys.get("speed:count").unwrap().as_deref(), Some("100"));
        assert_eq!(schedule(&mut keys, T0, 1), T0 + 60);
    }

    #[test]
    fn elapsed_window_starts_fresh() {
        let mut keys = MemoryKeyspace::new();
        keys.at(T0 * 1000);

        assert_eq!(schedule(&mut keys, T0, 90), T0);
        assert_eq!(schedule(&mut keys, T0, 90), T0 + 60);

        // Still inside the carried window
        assert_eq!(schedule(&mut keys, T0 + 60, 5), T0 + 60);
        assert_eq!(keys.get("speed:count").unwrap().as_deref(), Some("95"));

        // Past it
        assert_eq!(schedule(&mut keys, T0 + 180, 5), T0 + 180);
        assert_eq!(keys.get("speed:count").unwrap().as_deref(), Some("5"));
    }

    #[test]
    fn oversized_batch_skips_a_single_period() {
        let mut keys = MemoryKeyspace::new();
        keys.at(T0 * 1000);

        assert_eq!(schedule(&mut keys, T0, 1), T0);
        assert_eq!(schedule(&mut keys, T0, 1_000), T0 + 60);
        assert_eq!(schedule(&mut keys, T0, 1), T0 + 120);
    }

    #[test]
    fn state_is_kept_for_a_day() {
        let mut keys = MemoryKeyspace::new();
        keys.at(T0 * 1000);

        schedule(&mut keys, T0, 1);
        assert_eq!(keys.pttl("speed:next"), 86_400_000);
        assert_eq!(keys.pttl("speed:count"), 86_400_000);
    }
}
