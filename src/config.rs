//! Configuration loading.
//!
//! Strongly-typed settings layered from a TOML file and environment
//! variables:
//!
//! 1. `scan_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `SCAN_DAQ_` (override)
//!
//! Every field has a default, so [`Settings::default`] yields a working
//! configuration without any file on disk.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "scan_daq.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCAN_DAQ_";

/// Top-level settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Identity of the (simulated) instrument.
    #[serde(default)]
    pub instrument: InstrumentSettings,
    /// Acquisition tuning.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
}

/// Application-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name used in logs.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Identity and nominal characteristics of the instrument.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Display name.
    #[serde(default = "default_instrument_name")]
    pub name: String,
    /// Model string.
    #[serde(default = "default_model")]
    pub model: String,
    /// Serial number.
    #[serde(default = "default_serial")]
    pub serial_number: String,
    /// Analyzer name stamped on generated scans.
    #[serde(default = "default_analyzer")]
    pub analyzer: String,
    /// Lower bound of the survey m/z range.
    #[serde(default = "default_min_mz")]
    pub min_mz: f64,
    /// Upper bound of the survey m/z range.
    #[serde(default = "default_max_mz")]
    pub max_mz: f64,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            name: default_instrument_name(),
            model: default_model(),
            serial_number: default_serial(),
            analyzer: default_analyzer(),
            min_mz: default_min_mz(),
            max_mz: default_max_mz(),
        }
    }
}

/// Acquisition tuning knobs; session options default from these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Target event rate, in scans per second across all orders.
    #[serde(default = "default_scans_per_second")]
    pub scans_per_second: f64,
    /// Upper bound on derived scans per survey scan.
    #[serde(default = "default_max_fragments")]
    pub max_fragments_per_survey: u32,
    /// Capacity of each session's pull queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Capacity of the controller-wide broadcast channels.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Whether events are snapshotted on handoff (see `auto_freeze` on the
    /// session options).
    #[serde(default = "default_auto_freeze")]
    pub auto_freeze: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            scans_per_second: default_scans_per_second(),
            max_fragments_per_survey: default_max_fragments(),
            queue_capacity: default_queue_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
            auto_freeze: default_auto_freeze(),
        }
    }
}

fn default_app_name() -> String {
    "scan_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_instrument_name() -> String {
    "Simulated LC-MS".to_string()
}

fn default_model() -> String {
    "Orbitrap Exploris 480".to_string()
}

fn default_serial() -> String {
    "SIM-0001".to_string()
}

fn default_analyzer() -> String {
    "Orbitrap".to_string()
}

fn default_min_mz() -> f64 {
    200.0
}

fn default_max_mz() -> f64 {
    2000.0
}

fn default_scans_per_second() -> f64 {
    10.0
}

fn default_max_fragments() -> u32 {
    4
}

fn default_queue_capacity() -> usize {
    512
}

fn default_broadcast_capacity() -> usize {
    1000
}

fn default_auto_freeze() -> bool {
    true
}

impl Settings {
    /// Loads settings from `scan_daq.toml` and `SCAN_DAQ_*` environment
    /// variables, on top of the built-in defaults.
    pub fn load() -> EngineResult<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Loads settings from an explicit TOML file path plus the environment.
    pub fn load_from(path: impl AsRef<Path>) -> EngineResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("_"))
            .extract()?;
        Ok(settings)
    }
}
