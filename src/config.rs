//! Layered configuration using Figment.
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. `config/scope_daq.toml` (or the file passed with `--config`)
//! 3. Environment variables prefixed with `SCOPE_DAQ_`, `__` between sections
//!    (e.g. `SCOPE_DAQ_STATISTICS__LOAD_OHMS=75`)
//!
//! # Example
//! ```no_run
//! use scope_daq::config::ScopeDaqConfig;
//!
//! let config = ScopeDaqConfig::load()?;
//! config.validate()?;
//! println!("Driver: {}", config.instrument.driver);
//! # Ok::<(), scope_daq::error::DaqError>(())
//! ```

use crate::data::statistics::StatisticsWindows;
use crate::error::{AppResult, DaqError};
use crate::hardware::MockScopeConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scope_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SCOPE_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeDaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument connection and simulation settings
    pub instrument: InstrumentConfig,
    /// Acquisition loop settings
    pub acquisition: AcquisitionConfig,
    /// Statistics windows and load
    pub statistics: StatisticsWindows,
    /// Tabular storage settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scope-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Driver name. Only `simulated` ships.
    pub driver: String,
    /// Network address of the instrument
    pub address: String,
    /// Per-command timeout in milliseconds
    pub timeout_ms: u64,
    /// Enabled channels (simulated driver)
    pub channels: Vec<u8>,
    /// Samples per trace (simulated driver)
    pub record_length: u32,
    /// Largest accepted sequence count (simulated driver)
    pub max_sequence: usize,
    /// Probability of a transient read failure (simulated driver)
    pub fault_rate: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            driver: "simulated".to_string(),
            address: "127.0.0.1".to_string(),
            timeout_ms: 5000,
            channels: vec![1, 2],
            record_length: 10000,
            max_sequence: 16,
            fault_rate: 0.0,
        }
    }
}

impl InstrumentConfig {
    /// Settings for the simulated oscilloscope.
    pub fn mock_config(&self) -> MockScopeConfig {
        MockScopeConfig {
            channels: self.channels.clone(),
            record_length: self.record_length,
            max_sequence: self.max_sequence,
            fault_rate: self.fault_rate,
            address: self.address.clone(),
            timeout_ms: self.timeout_ms,
            ..Default::default()
        }
    }
}

/// Acquisition loop configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Pause before retrying a discarded trigger, in milliseconds
    pub retry_delay_ms: u64,
    /// Treat a refused sequence count as an error instead of a warning
    pub require_exact_sequence: bool,
}

impl AcquisitionConfig {
    /// Retry delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// HDF5 deflate level (0-9, 0 disables compression)
    pub compression_level: u8,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression_level: 4,
        }
    }
}

impl ScopeDaqConfig {
    /// Load from the default file and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Provider stack used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(ScopeDaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.storage.compression_level > 9 {
            return Err(DaqError::Configuration(format!(
                "Invalid compression_level {}. Must be 0-9",
                self.storage.compression_level
            )));
        }

        if self.instrument.channels.is_empty() {
            return Err(DaqError::Configuration(
                "instrument.channels must list at least one channel".to_string(),
            ));
        }
        if self.instrument.timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "instrument.timeout_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.instrument.fault_rate) {
            return Err(DaqError::Configuration(format!(
                "instrument.fault_rate {} is not a probability",
                self.instrument.fault_rate
            )));
        }

        self.statistics.validate_shape()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_crunch_conventions() {
        let config = ScopeDaqConfig::default();
        assert_eq!(config.statistics.ped_start, 0);
        assert_eq!(config.statistics.ped_end, 2500);
        assert_eq!(config.statistics.win_start, 2500);
        assert_eq!(config.statistics.win_end, 10000);
        assert_eq!(config.statistics.load_ohms, 50.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: ScopeDaqConfig = ScopeDaqConfig::figment(dir.path().join("absent.toml"))
            .extract()
            .unwrap();
        assert_eq!(config.instrument.driver, "simulated");
    }

    #[test]
    fn file_overrides_only_what_it_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[statistics]
ped_end = 100
load_ohms = 25.0

[acquisition]
require_exact_sequence = true
"#
        )
        .unwrap();

        let config: ScopeDaqConfig = ScopeDaqConfig::figment(file.path()).extract().unwrap();
        assert_eq!(config.statistics.ped_end, 100);
        assert_eq!(config.statistics.load_ohms, 25.0);
        assert_eq!(config.statistics.win_end, 10000);
        assert!(config.acquisition.require_exact_sequence);
        assert_eq!(config.storage.compression_level, 4);
    }

    #[test]
    fn later_layers_win() {
        let dir = tempfile::tempdir().unwrap();
        let config: ScopeDaqConfig = ScopeDaqConfig::figment(dir.path().join("absent.toml"))
            .merge(("instrument.record_length", 2048))
            .extract()
            .unwrap();
        assert_eq!(config.instrument.record_length, 2048);
        assert_eq!(config.instrument.mock_config().record_length, 2048);
    }

    #[test]
    fn instrument_connection_settings_reach_driver() {
        let mut config = ScopeDaqConfig::default();
        config.instrument.address = "192.168.1.40".into();
        config.instrument.timeout_ms = 250;
        let mock = config.instrument.mock_config();
        assert_eq!(mock.address, "192.168.1.40");
        assert_eq!(mock.timeout_ms, 250);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ScopeDaqConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = ScopeDaqConfig::default();
        config.application.log_format = "xml".into();
        assert!(config.validate().is_err());

        let mut config = ScopeDaqConfig::default();
        config.storage.compression_level = 10;
        assert!(config.validate().is_err());

        let mut config = ScopeDaqConfig::default();
        config.instrument.channels.clear();
        assert!(config.validate().is_err());

        let mut config = ScopeDaqConfig::default();
        config.statistics.win_end = config.statistics.win_start;
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }
}
