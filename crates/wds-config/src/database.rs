//! Record store configuration.

use serde::{Deserialize, Serialize};

fn default_path() -> String {
    ".wds/datastore.db".to_string()
}

/// Default `busy_timeout` applied to every connection, in milliseconds.
const fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_path")]
    pub path: String,

    /// How long `SQLite` waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory databases cannot be shared between connections, and the engine
    /// opens one connection per write transaction.
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        !self.path.is_empty() && self.path != ":memory:"
    }
}
