//! Engine configuration.
//!
//! Values come from built-in defaults, optionally a JSON file, and finally
//! `NEUROVAULT_*` environment variables (a `.env` file is honoured).

use crate::error::{StorageError, StorageResult};
use crate::types::Modality;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Acquisition parameters of one persisted stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Samples per second
    pub sample_rate: f64,
    pub channel_count: usize,
    /// Physical units per quantization step
    pub scale_factor: f64,
}

impl StreamParams {
    pub fn sample_period_us(&self) -> f64 {
        1_000_000.0 / self.sample_rate
    }

    /// `<prefix>_SAMPLE_RATE`, `<prefix>_CHANNEL_COUNT`, `<prefix>_SCALE_FACTOR`
    fn apply_env(&mut self, prefix: &str) -> StorageResult<()> {
        if let Some(v) = env_parse(&format!("{}_SAMPLE_RATE", prefix))? {
            self.sample_rate = v;
        }
        if let Some(v) = env_parse(&format!("{}_CHANNEL_COUNT", prefix))? {
            self.channel_count = v;
        }
        if let Some(v) = env_parse(&format!("{}_SCALE_FACTOR", prefix))? {
            self.scale_factor = v;
        }
        Ok(())
    }

    fn validate(&self, name: &str) -> StorageResult<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0 && self.sample_rate <= 1_000_000.0) {
            return Err(StorageError::InvalidConfig(format!(
                "{}.sample_rate must be in (0, 1e6], got {}",
                name, self.sample_rate
            )));
        }
        if self.channel_count == 0 || self.channel_count > u8::MAX as usize {
            return Err(StorageError::InvalidConfig(format!(
                "{}.channel_count must be in 1..=255, got {}",
                name, self.channel_count
            )));
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return Err(StorageError::InvalidConfig(format!(
                "{}.scale_factor must be positive, got {}",
                name, self.scale_factor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub storage_limit_bytes: u64,
    pub eeg_chunk_duration_s: f64,
    pub nirs_chunk_duration_s: f64,
    pub flush_interval_ms: u64,
    /// Fraction of the limit at which eviction starts
    pub cleanup_threshold: f64,
    pub busy_timeout_ms: u64,
    /// Upper bound for draining pending chunks on writer shutdown
    pub stop_timeout_ms: u64,
    pub eeg: StreamParams,
    pub nirs: StreamParams,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_limit_bytes: 300 * GIB,
            eeg_chunk_duration_s: 1.0,
            nirs_chunk_duration_s: 10.0,
            flush_interval_ms: 500,
            cleanup_threshold: 0.9,
            busy_timeout_ms: 5_000,
            stop_timeout_ms: 5_000,
            eeg: StreamParams {
                sample_rate: 160.0,
                channel_count: 2,
                scale_factor: 0.076,
            },
            nirs: StreamParams {
                sample_rate: 1.0,
                channel_count: 4,
                scale_factor: 0.01,
            },
        }
    }
}

impl StorageConfig {
    /// Load a JSON config file; missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: StorageConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `NEUROVAULT_*` environment variables.
    pub fn from_env() -> StorageResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `NEUROVAULT_*` environment variables onto this config.
    pub fn apply_env(&mut self) -> StorageResult<()> {
        dotenvy::dotenv().ok();

        if let Some(v) = env_parse("NEUROVAULT_STORAGE_LIMIT_BYTES")? {
            self.storage_limit_bytes = v;
        }
        if let Some(v) = env_parse("NEUROVAULT_EEG_CHUNK_DURATION_S")? {
            self.eeg_chunk_duration_s = v;
        }
        if let Some(v) = env_parse("NEUROVAULT_NIRS_CHUNK_DURATION_S")? {
            self.nirs_chunk_duration_s = v;
        }
        if let Some(v) = env_parse("NEUROVAULT_FLUSH_INTERVAL_MS")? {
            self.flush_interval_ms = v;
        }
        if let Some(v) = env_parse("NEUROVAULT_CLEANUP_THRESHOLD")? {
            self.cleanup_threshold = v;
        }
        if let Some(v) = env_parse("NEUROVAULT_BUSY_TIMEOUT_MS")? {
            self.busy_timeout_ms = v;
        }
        if let Some(v) = env_parse("NEUROVAULT_STOP_TIMEOUT_MS")? {
            self.stop_timeout_ms = v;
        }
        self.eeg.apply_env("NEUROVAULT_EEG")?;
        self.nirs.apply_env("NEUROVAULT_NIRS")?;
        Ok(())
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.storage_limit_bytes == 0 {
            return Err(StorageError::InvalidConfig(
                "storage_limit_bytes must be greater than zero".to_string(),
            ));
        }
        if !(self.cleanup_threshold > 0.0 && self.cleanup_threshold <= 1.0) {
            return Err(StorageError::InvalidConfig(format!(
                "cleanup_threshold must be in (0, 1], got {}",
                self.cleanup_threshold
            )));
        }
        for (name, duration) in [
            ("eeg_chunk_duration_s", self.eeg_chunk_duration_s),
            ("nirs_chunk_duration_s", self.nirs_chunk_duration_s),
        ] {
            if !(duration.is_finite() && duration > 0.0) {
                return Err(StorageError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, duration
                )));
            }
        }
        if self.flush_interval_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.eeg.validate("eeg")?;
        self.nirs.validate("nirs")?;
        Ok(())
    }

    pub fn stream(&self, modality: Modality) -> &StreamParams {
        match modality {
            Modality::Eeg => &self.eeg,
            Modality::Nirs => &self.nirs,
        }
    }

    /// Number of samples that make up one full chunk of `modality`.
    pub fn samples_per_chunk(&self, modality: Modality) -> usize {
        let seconds = match modality {
            Modality::Eeg => self.eeg_chunk_duration_s,
            Modality::Nirs => self.nirs_chunk_duration_s,
        };
        ((seconds * self.stream(modality).sample_rate).round() as usize).max(1)
    }

    pub fn cleanup_target_bytes(&self) -> u64 {
        (self.storage_limit_bytes as f64 * self.cleanup_threshold) as u64
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Playback and synchronization tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Maximum tolerated distance between a source and the clock
    pub sync_tolerance_us: i64,
    pub tick_interval_ms: u64,
    /// Longest run of absent samples that may be bridged by interpolation
    pub max_interpolated_samples: usize,
    pub max_interpolated_gap_us: i64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sync_tolerance_us: 100_000,
            tick_interval_ms: 16,
            max_interpolated_samples: 4,
            max_interpolated_gap_us: 25_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> StorageResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| StorageError::InvalidConfig(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = StorageConfig::default();
        assert_eq!(config.storage_limit_bytes, 300 * GIB);
        assert_eq!(config.eeg_chunk_duration_s, 1.0);
        assert_eq!(config.nirs_chunk_duration_s, 10.0);
        assert_eq!(config.flush_interval_ms, 500);
        assert_eq!(config.cleanup_threshold, 0.9);
        assert!(config.validate().is_ok());
        assert_eq!(config.samples_per_chunk(Modality::Eeg), 160);
        assert_eq!(config.samples_per_chunk(Modality::Nirs), 10);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"storage_limit_bytes": 5000, "cleanup_threshold": 0.5}"#)
            .unwrap();

        let config = StorageConfig::from_file(&path).unwrap();
        assert_eq!(config.storage_limit_bytes, 5000);
        assert_eq!(config.cleanup_threshold, 0.5);
        assert_eq!(config.flush_interval_ms, 500);
        assert_eq!(config.cleanup_target_bytes(), 2500);
    }

    #[test]
    fn test_env_overlay_covers_both_streams() {
        let vars = [
            ("NEUROVAULT_STOP_TIMEOUT_MS", "1500"),
            ("NEUROVAULT_NIRS_SAMPLE_RATE", "2.5"),
            ("NEUROVAULT_NIRS_CHANNEL_COUNT", "8"),
            ("NEUROVAULT_NIRS_SCALE_FACTOR", "0.02"),
            ("NEUROVAULT_EEG_CHANNEL_COUNT", "19"),
        ];
        for (key, value) in vars {
            env::set_var(key, value);
        }
        let config = StorageConfig::from_env();
        for (key, _) in vars {
            env::remove_var(key);
        }

        let config = config.unwrap();
        assert_eq!(config.stop_timeout(), Duration::from_millis(1500));
        assert_eq!(config.nirs.sample_rate, 2.5);
        assert_eq!(config.nirs.channel_count, 8);
        assert_eq!(config.nirs.scale_factor, 0.02);
        assert_eq!(config.eeg.channel_count, 19);
        assert_eq!(config.eeg.sample_rate, 160.0);
        assert_eq!(config.samples_per_chunk(Modality::Nirs), 25);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = StorageConfig::default();
        config.cleanup_threshold = 1.5;
        assert!(matches!(config.validate(), Err(StorageError::InvalidConfig(_))));

        let mut config = StorageConfig::default();
        config.eeg.channel_count = 300;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.nirs.scale_factor = 0.0;
        assert!(config.validate().is_err());
    }
}
