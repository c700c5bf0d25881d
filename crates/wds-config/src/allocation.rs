//! Participant allocation configuration.

use serde::{Deserialize, Serialize};

fn default_group_name() -> String {
    "Default".to_string()
}

/// Target given to the group created automatically for a new experiment.
/// Large enough that single-group experiments never fill up in practice.
const fn default_completion_target() -> i64 {
    1_000
}

/// How long a request waits for another request on the same experiment.
const fn default_lock_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocationConfig {
    /// Name of the group created for an experiment saved without groups.
    #[serde(default = "default_group_name")]
    pub default_group_name: String,

    /// Completion target of that default group.
    #[serde(default = "default_completion_target")]
    pub default_completion_target: i64,

    /// Experiment lock acquisition timeout, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            default_group_name: default_group_name(),
            default_completion_target: default_completion_target(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}
