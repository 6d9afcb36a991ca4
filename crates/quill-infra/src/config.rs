//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.quill/` by default) into
//! [`EngineConfig`]. A missing or malformed file yields the defaults.

use std::path::Path;

use quill_types::config::EngineConfig;

/// Shortest driver lease that still leaves room to renew it while steps run.
const MIN_DRIVER_LEASE_MS: u64 = 1_000;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - Otherwise the parsed config; absent keys take their defaults and
///   zero-valued limits are raised to 1.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Raise limits that would stall the engine to their smallest usable value.
fn normalize(mut config: EngineConfig) -> EngineConfig {
    fn at_least_one<T: PartialEq + From<u8> + Copy>(name: &str, value: &mut T) {
        if *value == T::from(0) {
            tracing::warn!("config.toml: {name} = 0 is not usable, using 1");
            *value = T::from(1);
        }
    }

    at_least_one("step_timeout_secs", &mut config.step_timeout_secs);
    at_least_one("retry.max_attempts", &mut config.retry.max_attempts);
    at_least_one("checkpoint_write_attempts", &mut config.checkpoint_write_attempts);
    at_least_one("max_batches_per_advance", &mut config.max_batches_per_advance);
    at_least_one("event_bus_capacity", &mut config.event_bus_capacity);

    if config.driver_lease_ms < MIN_DRIVER_LEASE_MS {
        tracing::warn!(
            "config.toml: driver_lease_ms = {} is too short, using {MIN_DRIVER_LEASE_MS}",
            config.driver_lease_ms
        );
        config.driver_lease_ms = MIN_DRIVER_LEASE_MS;
    }

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        tracing::warn!(
            "config.toml: retry.max_delay_ms is below retry.base_delay_ms, using {}",
            config.retry.base_delay_ms
        );
        config.retry.max_delay_ms = config.retry.base_delay_ms;
    }
    config
}
