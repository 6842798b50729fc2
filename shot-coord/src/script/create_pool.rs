use std::time::Duration;

use super::Script;
use super::exactly;
use crate::error::Result;
use crate::store::Keyspace;
use crate::store::SetOptions;

/// Initializes a semaphore pool unless its creation marker exists.
///
/// KEYS: `[available, taken, created]`
/// ARGV: `[resource_count, expiration_ms, created_at_ms]`
///
/// Returns 1 when this call created the pool, 0 when it already existed.
pub static CREATE_POOL: Script = Script::new("create_pool", LUA, transition);

const LUA: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 0 then
  redis.call('DEL', KEYS[1])
  redis.call('DEL', KEYS[2])
  for i = 1, tonumber(ARGV[1]) do
    redis.call('LPUSH', KEYS[1], i)
  end
  redis.call('SET', KEYS[3], ARGV[3])
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  redis.call('PEXPIRE', KEYS[3], ARGV[2])
  return 1
end
return 0
"#;

fn transition(keys: &mut dyn Keyspace, key_names: &[String], args: &[i64]) -> Result<i64> {
    let [available, taken, created] = exactly::<_, 3>(CREATE_POOL.name, "keys", key_names)?;
    let [resource_count, expiration_ms, created_at] =
        *exactly::<_, 3>(CREATE_POOL.name, "arguments", args)?;

    if keys.exists(created) {
        return Ok(0);
    }

    keys.del(available);
    keys.del(taken);
    for token in 1..=resource_count {
        keys.lpush(available, &token.to_string())?;
    }
    keys.set(created, &created_at.to_string(), SetOptions::default())?;

    let expiration = Duration::from_millis(expiration_ms.max(0) as u64);
    keys.pexpire(available, expiration);
    keys.pexpire(created, expiration);
    Ok(1)
}
