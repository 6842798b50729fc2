/// Errors produced by the coordination primitives and their stores.
///
/// Failing to obtain a lock or a semaphore token is *not* an error; see
/// [`LockOutcome`](crate::LockOutcome) and [`FrequencyLock::acquire`](crate::FrequencyLock::acquire).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    /// The store could not be reached, timed out, or rejected the command.
    ///
    /// The string contains the `Display` representation of the transport error.
    /// These are never retried here; retry policy belongs to the caller.
    #[error("Store transport error: {0}")]
    Transport(String),

    /// A command was applied to a key holding a different kind of value.
    #[error("Operation against key {key} holding the wrong kind of value")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// An increment was applied to a value that is not an integer.
    #[error("Value at key {key} is not an integer")]
    NotAnInteger {
        /// The offending key.
        key: String,
    },

    /// The store answered with something the caller cannot interpret.
    #[error("Unexpected reply from store: {0}")]
    UnexpectedReply(String),

    /// A script was invoked with the wrong keys or arguments.
    #[error("Script {script} called with bad arguments: {reason}")]
    ScriptArguments {
        /// The name of the script that was invoked.
        script: &'static str,
        /// What was wrong with the keys or arguments.
        reason: String,
    },
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CoordError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T, E = CoordError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_arguments_name_the_script() {
        let err = CoordError::ScriptArguments {
            script: "release_lease",
            reason: "expected 2 arguments, got 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Script release_lease called with bad arguments: expected 2 arguments, got 1"
        );
    }
}
