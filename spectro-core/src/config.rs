//! # Pipeline Configuration
//!
//! Every tunable of the ingest pipeline lives in [`PipelineConfig`]. The
//! defaults match the deployed sensor: 1024 samples per packet, a live
//! batch of 3950 packets and a reference exposure of 39500 packets.
//!
//! Configuration is stored as JSON. Missing fields fall back to their
//! defaults so a file only needs to name what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::predictor::PredictorConfig;

/// Number of samples in one sensor packet.
pub const SPECTRUM_LEN: usize = 1024;

/// Packets averaged into one live spectrum.
pub const SPECTRUM_THRESHOLD: usize = 3950;

/// Packets averaged into one black or white reference.
pub const REFERENCE_THRESHOLD: usize = 39500;

/// Reference progress is reported to the status line every this many packets.
pub const PROGRESS_REPORT_INTERVAL: usize = 1000;

/// Denominators below this magnitude skip the black/white correction.
pub const CORRECTION_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Samples per spectrum (N).
    pub spectrum_len: usize,
    /// Packets per live batch.
    pub spectrum_threshold: usize,
    /// Packets per reference batch.
    pub reference_threshold: usize,
    pub progress_report_interval: usize,
    /// Window of the packets-per-second counter, in milliseconds.
    pub rate_window_ms: u64,
    /// Upper bound on waiting for a worker thread to exit, in milliseconds.
    pub join_timeout_ms: u64,
    /// Requested `SO_RCVBUF` for the UDP socket.
    pub recv_buffer_bytes: usize,
    pub correction_epsilon: f64,
    /// Wavelength of the first sample, in nm.
    pub wavelength_start_nm: f64,
    /// Wavelength of the last sample, in nm.
    pub wavelength_end_nm: f64,
    pub port: u16,
    /// Empty means every interface.
    pub bind_address: String,
    pub log_dir: PathBuf,
    /// Entries kept in the in-memory log ring.
    pub log_capacity: usize,
    pub predictors: Vec<PredictorConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            spectrum_len: SPECTRUM_LEN,
            spectrum_threshold: SPECTRUM_THRESHOLD,
            reference_threshold: REFERENCE_THRESHOLD,
            progress_report_interval: PROGRESS_REPORT_INTERVAL,
            rate_window_ms: 1000,
            join_timeout_ms: 1000,
            recv_buffer_bytes: 4 * 1024 * 1024,
            correction_epsilon: CORRECTION_EPSILON,
            wavelength_start_nm: 1000.0,
            wavelength_end_nm: 1600.0,
            port: 1234,
            bind_address: String::new(),
            log_dir: PathBuf::from("log"),
            log_capacity: 10_000,
            predictors: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration from a JSON file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, json).with_context(|| format!("writing config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.spectrum_len == 0 {
            bail!("spectrum_len must be at least 1");
        }
        if self.spectrum_threshold == 0 || self.reference_threshold == 0 {
            bail!("batch thresholds must be at least 1");
        }
        if self.progress_report_interval == 0 {
            bail!("progress_report_interval must be at least 1");
        }
        if self.rate_window_ms == 0 {
            bail!("rate_window_ms must be at least 1");
        }
        if !(self.correction_epsilon >= 0.0) {
            bail!("correction_epsilon must be a non-negative number");
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Largest datagram the receiver reads: a 4-byte header allowance plus
    /// two bytes per sample, with some slack.
    pub fn datagram_capacity(&self) -> usize {
        4 + 2 * self.spectrum_len + 48
    }

    /// Wavelength of every sample index, spread linearly over the
    /// configured range.
    pub fn wavelengths(&self, len: usize) -> Vec<f64> {
        wavelength_axis(self.wavelength_start_nm, self.wavelength_end_nm, len)
    }
}

/// Maps `len` sample indices linearly onto `[start, end]`.
pub fn wavelength_axis(start: f64, end: f64, len: usize) -> Vec<f64> {
    let step = if len > 1 {
        (end - start) / (len - 1) as f64
    } else {
        0.0
    };
    (0..len).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_sensor() {
        let config = PipelineConfig::default();
        assert_eq!(config.spectrum_len, 1024);
        assert_eq!(config.spectrum_threshold, 3950);
        assert_eq!(config.reference_threshold, 39500);
        assert_eq!(config.datagram_capacity(), 2100);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{ "spectrum_threshold": 10, "port": 5000 }"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.spectrum_threshold, 10);
        assert_eq!(config.port, 5000);
        assert_eq!(config.spectrum_len, SPECTRUM_LEN);
        assert_eq!(config.reference_threshold, REFERENCE_THRESHOLD);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let config = PipelineConfig {
            bind_address: "127.0.0.1".to_string(),
            correction_epsilon: 1e-9,
            ..PipelineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let config = PipelineConfig {
            spectrum_threshold: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn wavelength_axis_spans_the_range() {
        let axis = wavelength_axis(1000.0, 1600.0, 1024);
        assert_eq!(axis.len(), 1024);
        assert_eq!(axis[0], 1000.0);
        assert!((axis[1023] - 1600.0).abs() < 1e-9);
        assert_eq!(wavelength_axis(1000.0, 1600.0, 1), vec![1000.0]);
    }
}
