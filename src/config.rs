//! Configuration loading and schema definitions for testbed.
//!
//! Configuration comes from a TOML file (every section is optional) and is
//! then overridden by environment variables, which is how the hosting
//! runtime usually tunes timeouts per deployment.
//!
//! # Environment Overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `EVENT_DATA_TIMEOUT` | `engine.event_data_timeout_secs` |
//! | `WAIT_FOR_IUT_TIMEOUT` | `engine.wait_for_iut_timeout_secs` |
//! | `WAIT_FOR_EXECUTION_SPACE_TIMEOUT` | `engine.wait_for_execution_space_timeout_secs` |
//! | `WAIT_FOR_LOG_AREA_TIMEOUT` | `engine.wait_for_log_area_timeout_secs` |
//! | `MAX_PARALLEL_IUTS` | `engine.max_parallel_iuts` |

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, anyhow};

/// Loads testbed configuration from a TOML file and applies environment
/// overrides.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - An override variable is set but is not an unsigned integer
///
/// # Example
///
/// ```no_run
/// use testbed::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testbed.toml"))?;
/// println!("IUT timeout: {}s", config.engine.wait_for_iut_timeout_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Loads testbed configuration from a TOML string, without environment
/// overrides.
///
/// # Example
///
/// ```
/// use testbed::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [engine]
///     wait_for_iut_timeout_secs = 60
///     max_parallel_iuts = 4
/// "#)?;
///
/// assert_eq!(config.engine.wait_for_iut_timeout_secs, 60);
/// assert_eq!(config.engine.max_parallel_iuts, Some(4));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Applies environment-style overrides to a loaded configuration.
///
/// `lookup` returns the raw value of a variable, if set. Taking a closure
/// instead of reading the process environment keeps this testable.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let parse = |key: &str| -> Result<Option<u64>> {
        match lookup(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| anyhow!("Invalid value {:?} for {}: {}", raw, key, e)),
        }
    };

    let engine = &mut config.engine;
    if let Some(v) = parse("EVENT_DATA_TIMEOUT")? {
        engine.event_data_timeout_secs = v;
    }
    if let Some(v) = parse("WAIT_FOR_IUT_TIMEOUT")? {
        engine.wait_for_iut_timeout_secs = v;
    }
    if let Some(v) = parse("WAIT_FOR_EXECUTION_SPACE_TIMEOUT")? {
        engine.wait_for_execution_space_timeout_secs = v;
    }
    if let Some(v) = parse("WAIT_FOR_LOG_AREA_TIMEOUT")? {
        engine.wait_for_log_area_timeout_secs = v;
    }
    if let Some(v) = parse("MAX_PARALLEL_IUTS")? {
        engine.max_parallel_iuts = Some(usize::try_from(v).unwrap_or(usize::MAX));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.engine.wait_for_iut_timeout_secs, 10);
        assert_eq!(config.engine.poll_interval_secs, 5);
        assert_eq!(config.engine.max_parallel_iuts, None);
        assert!(!config.engine.controller);
        assert!(matches!(config.store, StoreConfig::Memory));
    }

    #[test]
    fn test_checkout_deadline_sums_timeouts_and_grace() {
        let config = load_config_str(
            r#"
            [engine]
            wait_for_iut_timeout_secs = 1
            wait_for_execution_space_timeout_secs = 2
            wait_for_log_area_timeout_secs = 3
            grace_secs = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.checkout_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let vars: HashMap<&str, &str> = [
            ("WAIT_FOR_IUT_TIMEOUT", "120"),
            ("MAX_PARALLEL_IUTS", " 3 "),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.engine.wait_for_iut_timeout_secs, 120);
        assert_eq!(config.engine.max_parallel_iuts, Some(3));
        assert_eq!(config.engine.wait_for_log_area_timeout_secs, 10);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "EVENT_DATA_TIMEOUT").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("EVENT_DATA_TIMEOUT"));
    }

    #[test]
    fn test_huge_timeouts_saturate_deadline() {
        let mut config = Config::default();
        let max = u64::MAX.to_string();
        apply_env_overrides(&mut config, |k| {
            (k == "WAIT_FOR_IUT_TIMEOUT").then(|| max.clone())
        })
        .unwrap();

        assert_eq!(config.engine.wait_for_iut_timeout_secs, u64::MAX);
        assert_eq!(config.engine.checkout_deadline(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_file_store_and_executor_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [store]
            type = "file"
            path = "/var/lib/testbed"

            [executor]
            environment_provider_url = "http://provider:8080"

            [executor.environment]
            LOG_LEVEL = "debug"
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        match &config.store {
            StoreConfig::File { path } => assert_eq!(path, "/var/lib/testbed"),
            other => panic!("unexpected store config: {other:?}"),
        }
        assert_eq!(config.executor.environment_provider_url, "http://provider:8080");
        assert_eq!(
            config.executor.environment.get("LOG_LEVEL").map(String::as_str),
            Some("debug")
        );
    }
}
