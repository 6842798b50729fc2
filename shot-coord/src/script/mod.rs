//! Atomic multi-key transitions.
//!
//! Each script exists twice: as Lua, for stores that execute scripts
//! server-side, and as a Rust function over [`Keyspace`], for stores that
//! can hold their keys exclusively (and for testing the transition on its
//! own). Both take the same explicit key list and integer argument list and
//! must behave identically.

use std::fmt;

use crate::error::CoordError;
use crate::error::Result;
use crate::store::Keyspace;

mod create_pool;
mod release_lease;
mod send_speed;

pub use create_pool::CREATE_POOL;
pub use release_lease::RELEASE_LEASE;
pub use send_speed::SEND_SPEED;

type Transition = fn(&mut dyn Keyspace, &[String], &[i64]) -> Result<i64>;

/// An atomic script over explicit keys and integer arguments.
pub struct Script {
    name: &'static str,
    lua: &'static str,
    transition: Transition,
}

impl Script {
    pub(crate) const fn new(name: &'static str, lua: &'static str, transition: Transition) -> Self {
        Self {
            name,
            lua,
            transition,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The Lua source, using `KEYS` and `ARGV` as Redis `EVAL` does.
    pub fn lua(&self) -> &'static str {
        self.lua
    }

    /// Applies the transition to a keyspace the caller holds exclusively.
    pub fn run(&self, keyspace: &mut dyn Keyspace, keys: &[String], args: &[i64]) -> Result<i64> {
        (self.transition)(keyspace, keys, args)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish()
    }
}

/// Destructures exactly `N` values, naming the script on mismatch.
pub(crate) fn exactly<'a, T, const N: usize>(
    script: &'static str,
    what: &str,
    values: &'a [T],
) -> Result<&'a [T; N]> {
    values
        .try_into()
        .map_err(|_| CoordError::ScriptArguments {
            script,
            reason: format!("expected {N} {what}, got {}", values.len()),
        })
}
