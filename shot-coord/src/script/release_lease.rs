use std::time::Duration;

use super::Script;
use super::exactly;
use crate::error::Result;
use crate::store::Keyspace;

/// Returns a leased token to the pool.
///
/// KEYS: `[available, taken, created]`
/// ARGV: `[token, unrecorded]`
///
/// The token is pushed back only if this call removed it from `taken`, so a
/// second release of the same lease (a reclamation pass racing the holder, or
/// a holder finishing after the pool was recreated) is a no-op. A caller whose
/// lease was never recorded passes `unrecorded = 1`, and its token is pushed
/// back regardless. A list key recreated by the push inherits the creation
/// marker's remaining ttl.
///
/// Returns 1 when the token was returned, 0 otherwise.
pub static RELEASE_LEASE: Script = Script::new("release_lease", LUA, transition);

const LUA: &str = r#"
local removed = redis.call('HDEL', KEYS[2], ARGV[1])
if removed == 1 or ARGV[2] == '1' then
  redis.call('LPUSH', KEYS[1], ARGV[1])
  if redis.call('PTTL', KEYS[1]) < 0 then
    local ttl = redis.call('PTTL', KEYS[3])
    if ttl > 0 then
      redis.call('PEXPIRE', KEYS[1], ttl)
    end
  end
  return 1
end
return 0
"#;

fn transition(keys: &mut dyn Keyspace, key_names: &[String], args: &[i64]) -> Result<i64> {
    let [available, taken, created] = exactly::<_, 3>(RELEASE_LEASE.name, "keys", key_names)?;
    let [token, unrecorded] = *exactly::<_, 2>(RELEASE_LEASE.name, "arguments", args)?;
    let token = token.to_string();

    let removed = keys.hdel(taken, &token)?;
    if !removed && unrecorded != 1 {
        return Ok(0);
    }

    keys.lpush(available, &token)?;
    if keys.pttl(available) < 0 {
        let ttl = keys.pttl(created);
        if ttl > 0 {
            keys.pexpire(available, Duration::from_millis(ttl as u64));
        }
    }
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyspace;
    use crate::store::SetOptions;

    fn names() -> Vec<String> {
        ["pool:list", "pool:taken", "pool:created"]
            .map(String::from)
            .to_vec()
    }

    #[test]
    fn releases_each_lease_once() {
        let mut keys = MemoryKeyspace::new();
        keys.at(0);
        keys.hset("pool:taken", "2", "0").unwrap();

        assert_eq!(RELEASE_LEASE.run(&mut keys, &names(), &[2, 0]).unwrap(), 1);
        assert_eq!(RELEASE_LEASE.run(&mut keys, &names(), &[2, 0]).unwrap(), 0);

        assert_eq!(keys.llen("pool:list").unwrap(), 1);
        assert!(!keys.exists("pool:taken"));
    }

    #[test]
    fn unknown_lease_is_not_pushed() {
        let mut keys = MemoryKeyspace::new();
        keys.at(0);

        assert_eq!(RELEASE_LEASE.run(&mut keys, &names(), &[1, 0]).unwrap(), 0);
        assert!(!keys.exists("pool:list"));
    }

    #[test]
    fn unrecorded_lease_is_pushed_back() {
        let mut keys = MemoryKeyspace::new();
        keys.at(0);

        assert_eq!(RELEASE_LEASE.run(&mut keys, &names(), &[1, 1]).unwrap(), 1);
        assert_eq!(keys.llen("pool:list").unwrap(), 1);
        assert!(!keys.exists("pool:taken"));
    }

    #[test]
    fn recreated_list_inherits_marker_ttl() {
        let mut keys = MemoryKeyspace::new();
        keys.at(0);
        keys.set(
            "pool:created",
            "0",
            SetOptions::default().with_ttl(Duration::from_secs(30)),
        )
        .unwrap();
        keys.hset("pool:taken", "1", "0").unwrap();

        keys.at(10_000);
        RELEASE_LEASE.run(&mut keys, &names(), &[1, 0]).unwrap();

        assert_eq!(keys.pttl("pool:list"), 20_000);
    }
}
