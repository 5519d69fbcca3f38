use crate::error::{self, Result};
use serde::Deserialize;
use snafu::ResultExt;
use std::time::Duration;

/// The prefix of every environment variable read into [`Settings`].
pub const ENV_PREFIX: &str = "MESH_E2E_";

/// Settings that tune how the harness talks to a cluster. They are read from environment variables
/// with the [`ENV_PREFIX`] prefix, so they can be changed without touching the tests.
///
/// # Example
///
/// ```text
/// MESH_E2E_HTTP_TIMEOUT_SECS=10
/// MESH_E2E_CONTAINER=curl
/// MESH_E2E_MAX_IN_FLIGHT=32
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Seconds between two attempts of a repeated-success wait.
    #[serde(default = "poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Passed to `curl --max-time` for every HTTP request.
    #[serde(default = "http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// The container in source pods that requests are sent from. The pod's default container is
    /// used when unset.
    #[serde(default)]
    pub container: Option<String>,

    /// Limits how many requests are in flight at once when many are issued together. Unbounded
    /// when unset or `0`.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: poll_interval_secs(),
            http_timeout_secs: http_timeout_secs(),
            container: None,
            max_in_flight: None,
        }
    }
}

impl Settings {
    /// Read the settings from the process environment.
    pub fn from_env() -> Result<Self> {
        envy::prefixed(ENV_PREFIX)
            .from_env::<Settings>()
            .context(error::SettingsSnafu)
    }

    /// Read the settings from `(name, value)` pairs, using the same names as the environment.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX)
            .from_iter::<_, Settings>(vars)
            .context(error::SettingsSnafu)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// We need these to provide defaults for serde.
fn poll_interval_secs() -> u64 {
    1
}

fn http_timeout_secs() -> u64 {
    5
}
