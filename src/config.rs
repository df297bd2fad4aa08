//! Recorder configuration
//!
//! Settings come from three places, in increasing priority: built-in defaults,
//! an optional TOML file, and `RECORDER_*` environment variables set by the
//! job launcher.

use crate::error::{RecorderError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

pub const ENV_STORE_TID: &str = "RECORDER_STORE_TID";
pub const ENV_STORE_CALL_DEPTH: &str = "RECORDER_STORE_CALL_DEPTH";
pub const ENV_TIME_RESOLUTION: &str = "RECORDER_TIME_RESOLUTION";
pub const ENV_TIME_COMPRESSION: &str = "RECORDER_TIME_COMPRESSION";
pub const ENV_INTERPROCESS_COMPRESSION: &str = "RECORDER_INTERPROCESS_COMPRESSION";
pub const ENV_INTERPROCESS_PATTERN_RECOGNITION: &str = "RECORDER_INTERPROCESS_PATTERN_RECOGNITION";
pub const ENV_INTRAPROCESS_PATTERN_RECOGNITION: &str = "RECORDER_INTRAPROCESS_PATTERN_RECOGNITION";
pub const ENV_WITH_NON_MPI: &str = "RECORDER_WITH_NON_MPI";
pub const ENV_TRACES_DIR: &str = "RECORDER_TRACES_DIR";

/// Output directory used when `traces_dir` is unset, relative to the working directory
pub const DEFAULT_TRACES_DIR: &str = "recorder-traces";

/// Configuration for one trace session
///
/// # Example
/// ```
/// use iorecorder::config::RecorderConfig;
///
/// let config = RecorderConfig::default();
/// assert_eq!(config.time_resolution, 1e-7); // 100ns ticks
/// assert!(config.store_call_depth);
/// assert!(!config.store_tid);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Keep the thread id in call signatures. Off by default: the same call
    /// made from different threads then shares one signature.
    pub store_tid: bool,

    /// Keep the nesting depth in call signatures
    pub store_call_depth: bool,

    /// Timestamp quantum in seconds
    pub time_resolution: f64,

    /// zlib-compress timestamp files
    pub ts_compression: bool,

    /// Initial timestamp buffer size, in u32 slots (two per call)
    pub ts_buffer_elements: usize,

    /// Buffer size at which timestamps spill to the scratch file instead of
    /// doubling again
    pub ts_spill_elements: usize,

    /// Merge call signature tables across ranks at finalize
    pub interprocess_compression: bool,

    pub interprocess_pattern_recognition: bool,
    pub intraprocess_pattern_recognition: bool,

    /// Single process run with no process group
    pub non_mpi: bool,

    /// Output directory override (default [`DEFAULT_TRACES_DIR`])
    pub traces_dir: Option<PathBuf>,

    /// Number of most recent terminals handed to call observers
    pub recent_window: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            store_tid: false,
            store_call_depth: true,
            time_resolution: 1e-7,
            ts_compression: true,
            ts_buffer_elements: 1024 * 1024, // half a million calls
            ts_spill_elements: 64 * 1024 * 1024,
            interprocess_compression: true,
            interprocess_pattern_recognition: false,
            intraprocess_pattern_recognition: false,
            non_mpi: false,
            traces_dir: None,
            recent_window: 16,
        }
    }
}

impl RecorderConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Parse a TOML document; missing keys keep their defaults
    ///
    /// # Example
    /// ```
    /// use iorecorder::config::RecorderConfig;
    ///
    /// let config = RecorderConfig::from_toml_str("store_tid = true\ntime_resolution = 1e-6").unwrap();
    /// assert!(config.store_tid);
    /// assert_eq!(config.time_resolution, 1e-6);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| RecorderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RECORDER_*` overrides using the given variable lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str, target: &mut bool| {
            if let Some(raw) = lookup(name) {
                match raw.trim().parse::<i64>() {
                    Ok(v) => *target = v != 0,
                    Err(_) => warn!("ignoring {}={:?}: not an integer", name, raw),
                }
            }
        };

        flag(ENV_STORE_TID, &mut self.store_tid);
        flag(ENV_STORE_CALL_DEPTH, &mut self.store_call_depth);
        flag(ENV_TIME_COMPRESSION, &mut self.ts_compression);
        flag(ENV_INTERPROCESS_COMPRESSION, &mut self.interprocess_compression);
        flag(
            ENV_INTERPROCESS_PATTERN_RECOGNITION,
            &mut self.interprocess_pattern_recognition,
        );
        flag(
            ENV_INTRAPROCESS_PATTERN_RECOGNITION,
            &mut self.intraprocess_pattern_recognition,
        );
        flag(ENV_WITH_NON_MPI, &mut self.non_mpi);

        if let Some(raw) = lookup(ENV_TIME_RESOLUTION) {
            match raw.trim().parse::<f64>() {
                Ok(v) if v.is_finite() && v > 0.0 => self.time_resolution = v,
                _ => warn!("ignoring {}={:?}: not a positive number", ENV_TIME_RESOLUTION, raw),
            }
        }

        if let Some(dir) = lookup(ENV_TRACES_DIR) {
            if !dir.is_empty() {
                self.traces_dir = Some(PathBuf::from(dir));
            }
        }

        // Interprocess settings are meaningless without a process group
        if self.non_mpi {
            self.interprocess_compression = false;
            self.interprocess_pattern_recognition = false;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.time_resolution.is_finite() || self.time_resolution <= 0.0 {
            return Err(RecorderError::Config(format!(
                "time_resolution must be a positive number, got {}",
                self.time_resolution
            )));
        }
        if self.ts_buffer_elements < 2 {
            return Err(RecorderError::Config(format!(
                "ts_buffer_elements must hold at least one call, got {}",
                self.ts_buffer_elements
            )));
        }
        if self.ts_spill_elements < self.ts_buffer_elements {
            return Err(RecorderError::Config(format!(
                "ts_spill_elements ({}) must be >= ts_buffer_elements ({})",
                self.ts_spill_elements, self.ts_buffer_elements
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        assert!(RecorderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RecorderConfig::default();
        config.apply_env(env_from(&[
            (ENV_STORE_TID, "1"),
            (ENV_STORE_CALL_DEPTH, "0"),
            (ENV_TIME_RESOLUTION, "0.000001"),
            (ENV_TRACES_DIR, "/tmp/traces"),
        ]));

        assert!(config.store_tid);
        assert!(!config.store_call_depth);
        assert_eq!(config.time_resolution, 1e-6);
        assert_eq!(config.traces_dir, Some(PathBuf::from("/tmp/traces")));
    }

    #[test]
    fn test_non_mpi_disables_interprocess() {
        let mut config = RecorderConfig::default();
        config.apply_env(env_from(&[
            (ENV_INTERPROCESS_PATTERN_RECOGNITION, "1"),
            (ENV_WITH_NON_MPI, "1"),
        ]));

        assert!(config.non_mpi);
        assert!(!config.interprocess_compression);
        assert!(!config.interprocess_pattern_recognition);
    }

    #[test]
    fn test_garbage_env_is_ignored() {
        let mut config = RecorderConfig::default();
        config.apply_env(env_from(&[
            (ENV_STORE_CALL_DEPTH, "yes"),
            (ENV_TIME_RESOLUTION, "-3"),
        ]));

        assert!(config.store_call_depth);
        assert_eq!(config.time_resolution, 1e-7);
    }

    #[test]
    fn test_validate_rejects_bad_resolution() {
        let config = RecorderConfig {
            time_resolution: 0.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RecorderError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_small_spill() {
        let config = RecorderConfig {
            ts_buffer_elements: 1024,
            ts_spill_elements: 512,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_document() {
        let config = RecorderConfig::from_toml_str(
            r#"
            interprocess_compression = false
            recent_window = 4
            "#,
        )
        .unwrap();

        assert!(!config.interprocess_compression);
        assert_eq!(config.recent_window, 4);
        assert!(config.store_call_depth); // default kept
    }

    #[test]
    fn test_toml_invalid_value() {
        assert!(RecorderConfig::from_toml_str("time_resolution = -1.0").is_err());
        assert!(RecorderConfig::from_toml_str("store_tid = \"maybe\"").is_err());
    }
}
