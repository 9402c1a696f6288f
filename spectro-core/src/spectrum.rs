//! # Spectrum Data Module
//!
//! Sample vectors as they move through the pipeline, and the averaging
//! and correction math applied to a batch of them.
//!
//! ## Types
//! - [`Spectrum`]: one decoded packet, immutable and cheap to share
//! - [`AveragedSpectrum`]: the element-wise mean of a batch with its range
//! - [`ReferenceKind`]: which calibration reference a value belongs to

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One decoded sensor packet.
///
/// Samples live behind an `Arc` so a packet routed to the processor and
/// both reference accumulators is never copied.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    samples: Arc<[f64]>,
}

impl Spectrum {
    pub fn new(samples: Vec<f64>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<f64>> for Spectrum {
    fn from(samples: Vec<f64>) -> Self {
        Self::new(samples)
    }
}

/// The mean of a batch of spectra together with its value range.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedSpectrum {
    samples: Arc<[f64]>,
    pub min: f64,
    pub max: f64,
    /// Batch members that had the expected length and entered the mean.
    pub contributors: usize,
}

impl AveragedSpectrum {
    /// Wraps already-averaged samples, computing the range.
    ///
    /// Used for references loaded from disk, where the batch is gone.
    pub fn from_samples(samples: Vec<f64>, contributors: usize) -> Self {
        let (min, max) = min_max(&samples);
        Self {
            samples: samples.into(),
            min,
            max,
            contributors,
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Calibration reference: dark (black) or full-scale (white) exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Black,
    White,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 2] = [ReferenceKind::Black, ReferenceKind::White];
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::Black => write!(f, "black"),
            ReferenceKind::White => write!(f, "white"),
        }
    }
}

/// Averages a batch element-wise over its members of length `len`.
///
/// Members of any other length are left out of both the sum and the
/// divisor. Returns `None` when no member has the expected length.
pub fn average_batch(batch: &[Spectrum], len: usize) -> Option<AveragedSpectrum> {
    let mut sums = vec![0.0_f64; len];
    let mut contributors = 0usize;

    for spectrum in batch.iter().filter(|s| s.len() == len) {
        for (sum, value) in sums.iter_mut().zip(spectrum.samples()) {
            *sum += value;
        }
        contributors += 1;
    }

    if contributors == 0 {
        return None;
    }

    let divisor = contributors as f64;
    for sum in sums.iter_mut() {
        *sum /= divisor;
    }
    Some(AveragedSpectrum::from_samples(sums, contributors))
}

/// Smallest and largest value; `(0.0, 0.0)` for an empty slice.
pub fn min_max(values: &[f64]) -> (f64, f64) {
    let Some(&first) = values.first() else {
        return (0.0, 0.0);
    };
    values
        .iter()
        .skip(1)
        .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Result of a black/white correction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub values: Vec<f64>,
    /// Indices where the reference span was too small and the raw value was kept.
    pub fallbacks: usize,
}

/// Normalizes `raw` against the black and white references:
/// `(raw - black) / (white - black)`.
///
/// Where `|white - black| < epsilon` the raw value is kept unchanged.
/// All three slices must have the same length.
pub fn apply_correction(raw: &[f64], black: &[f64], white: &[f64], epsilon: f64) -> Correction {
    debug_assert_eq!(raw.len(), black.len());
    debug_assert_eq!(raw.len(), white.len());

    let mut fallbacks = 0;
    let values = raw
        .iter()
        .zip(black.iter().zip(white))
        .map(|(&r, (&b, &w))| {
            let span = w - b;
            if span.abs() < epsilon {
                fallbacks += 1;
                r
            } else {
                (r - b) / span
            }
        })
        .collect();

    Correction { values, fallbacks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum(values: &[f64]) -> Spectrum {
        Spectrum::new(values.to_vec())
    }

    #[test]
    fn average_is_the_per_index_mean() {
        let batch = vec![
            spectrum(&[1.0, 10.0, 100.0]),
            spectrum(&[2.0, 20.0, 200.0]),
            spectrum(&[6.0, 30.0, 600.0]),
        ];
        let avg = average_batch(&batch, 3).unwrap();
        assert_eq!(avg.samples(), &[3.0, 20.0, 300.0]);
        assert_eq!(avg.min, 3.0);
        assert_eq!(avg.max, 300.0);
        assert_eq!(avg.contributors, 3);
    }

    #[test]
    fn wrong_length_members_are_excluded() {
        let batch = vec![
            spectrum(&[2.0, 4.0, 6.0]),
            spectrum(&[1000.0, 1000.0]),
            spectrum(&[4.0, 8.0, 12.0]),
            spectrum(&[7.0, 7.0, 7.0, 7.0]),
        ];
        let avg = average_batch(&batch, 3).unwrap();
        assert_eq!(avg.samples(), &[3.0, 6.0, 9.0]);
        assert_eq!(avg.contributors, 2);
    }

    #[test]
    fn batch_without_valid_members_has_no_average() {
        let batch = vec![spectrum(&[1.0]), spectrum(&[])];
        assert!(average_batch(&batch, 3).is_none());
        assert!(average_batch(&[], 3).is_none());
    }

    #[test]
    fn correction_recovers_the_mixing_factor() {
        let black = [10.0, 0.0, -5.0, 3.0];
        let white = [110.0, 2.0, 5.0, 3.0];
        let k = 0.25;
        let raw: Vec<f64> = black
            .iter()
            .zip(&white)
            .map(|(b, w)| b + k * (w - b))
            .collect();

        let corrected = apply_correction(&raw, &black, &white, 1e-6);
        for (i, value) in corrected.values.iter().enumerate().take(3) {
            assert!((value - k).abs() < 1e-12, "index {i}: {value}");
        }
        // Zero span: raw value is kept.
        assert_eq!(corrected.values[3], raw[3]);
        assert_eq!(corrected.fallbacks, 1);
    }

    #[test]
    fn span_just_above_epsilon_is_corrected() {
        let corrected = apply_correction(&[1.0], &[1.0], &[1.0 + 2e-6], 1e-6);
        assert_eq!(corrected.values, vec![0.0]);
        assert_eq!(corrected.fallbacks, 0);
    }

    #[test]
    fn min_max_of_empty_slice_is_zero() {
        assert_eq!(min_max(&[]), (0.0, 0.0));
        assert_eq!(min_max(&[-1.0, 4.0, 2.0]), (-1.0, 4.0));
    }

    #[test]
    fn reference_kind_display() {
        assert_eq!(ReferenceKind::Black.to_string(), "black");
        assert_eq!(ReferenceKind::White.to_string(), "white");
    }
}
