//! Configuration schema definitions for testbed.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── EngineConfig     - Timeouts, poll intervals, parallelism cap
//! ├── StoreConfig      - Tagged enum selecting the configuration store
//! │   ├── Memory       - In-process store (tests, one-shot runs)
//! │   └── File         - Directory-backed store
//! └── ExecutorConfig   - Defaults baked into execution space instructions
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for testbed.
///
/// # TOML Structure
///
/// ```toml
/// [engine]
/// wait_for_iut_timeout_secs = 60
///
/// [store]
/// type = "file"
/// path = "~/.testbed/store"
///
/// [executor]
/// environment_provider_url = "http://testbed:8080"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Checkout engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Where provider configuration and checkout records live.
    #[serde(default)]
    pub store: StoreConfig,

    /// Defaults for execution space instructions.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Checkout engine settings.
///
/// All durations are whole seconds.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `event_data_timeout_secs` | 10 |
/// | `wait_for_iut_timeout_secs` | 10 |
/// | `wait_for_execution_space_timeout_secs` | 10 |
/// | `wait_for_log_area_timeout_secs` | 10 |
/// | `max_parallel_iuts` | None (bounded by recipe count only) |
/// | `poll_interval_secs` | 5 |
/// | `grace_secs` | 10 |
/// | `main_suite_timeout_secs` | 30 |
/// | `main_suite_poll_secs` | 5 |
/// | `controller` | false |
/// | `termination_log` | `/dev/termination-log` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// How long to wait for provider configuration to show up in the store.
    #[serde(default = "default_timeout")]
    pub event_data_timeout_secs: u64,

    /// How long a single IUT checkout may wait for the minimum amount.
    #[serde(default = "default_timeout")]
    pub wait_for_iut_timeout_secs: u64,

    /// How long a single execution space checkout may wait.
    #[serde(default = "default_timeout")]
    pub wait_for_execution_space_timeout_secs: u64,

    /// How long a single log area checkout may wait.
    #[serde(default = "default_timeout")]
    pub wait_for_log_area_timeout_secs: u64,

    /// Upper bound on IUTs checked out per loop iteration.
    pub max_parallel_iuts: Option<usize>,

    /// Sleep between poll attempts, in every wait loop.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Added on top of the three wait timeouts to form the checkout deadline.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// How long to wait for the main suite correlation id.
    #[serde(default = "default_main_suite_timeout")]
    pub main_suite_timeout_secs: u64,

    /// Poll interval while waiting for the main suite.
    #[serde(default = "default_poll_interval")]
    pub main_suite_poll_secs: u64,

    /// Running under a controller: the suite runner ids already are the
    /// test-suite-started ids, so there is no main suite to wait for.
    #[serde(default)]
    pub controller: bool,

    /// File the failure message is written to for the hosting runtime.
    #[serde(default = "default_termination_log")]
    pub termination_log: String,
}

impl EngineConfig {
    /// Aggregate deadline of one checkout loop. Saturates instead of
    /// overflowing.
    pub fn checkout_deadline(&self) -> Duration {
        Duration::from_secs(
            self.wait_for_iut_timeout_secs
                .saturating_add(self.wait_for_execution_space_timeout_secs)
                .saturating_add(self.wait_for_log_area_timeout_secs)
                .saturating_add(self.grace_secs),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_data_timeout_secs: default_timeout(),
            wait_for_iut_timeout_secs: default_timeout(),
            wait_for_execution_space_timeout_secs: default_timeout(),
            wait_for_log_area_timeout_secs: default_timeout(),
            max_parallel_iuts: None,
            poll_interval_secs: default_poll_interval(),
            grace_secs: default_grace(),
            main_suite_timeout_secs: default_main_suite_timeout(),
            main_suite_poll_secs: default_poll_interval(),
            controller: false,
            termination_log: default_termination_log(),
        }
    }
}

fn default_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_grace() -> u64 {
    10
}

fn default_main_suite_timeout() -> u64 {
    30
}

fn default_termination_log() -> String {
    "/dev/termination-log".to_string()
}

/// Configuration store selection.
///
/// ```toml
/// [store]
/// type = "file"
/// path = "~/.testbed/store"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Keep everything in process memory.
    #[default]
    Memory,

    /// One file per key below a root directory. `~` is expanded.
    File { path: String },
}

/// Defaults merged into every execution space's instructions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Base URL under which sub-suites are served to executors.
    #[serde(default = "default_provider_url")]
    pub environment_provider_url: String,

    /// Environment variables handed to every executor.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            environment_provider_url: default_provider_url(),
            environment: BTreeMap::new(),
        }
    }
}

fn default_provider_url() -> String {
    "http://localhost:8080".to_string()
}
