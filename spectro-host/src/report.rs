//! One-line status report printed on every host tick.

use spectro_core::SessionStats;
use spectro_core::coordinator::Progress;

/// What the host has seen since it started.
#[derive(Debug, Clone, Default)]
pub struct StatusLine {
    pub spectra: u64,
    pub last_range: Option<(f64, f64)>,
    pub last_prediction: Option<(usize, f64)>,
    pub last_message: Option<String>,
}

impl StatusLine {
    pub fn record_spectrum(&mut self, min: f64, max: f64) {
        self.spectra += 1;
        self.last_range = Some((min, max));
    }

    pub fn record_prediction(&mut self, predictor: usize, value: f64) {
        self.last_prediction = Some((predictor, value));
    }

    pub fn record_message(&mut self, message: impl Into<String>) {
        self.last_message = Some(message.into());
    }

    pub fn render(&self, stats: &SessionStats) -> String {
        let mut line = format!(
            "[{}] {} pkt/s, {} packets, {} spectra",
            if stats.receiving { "RX" } else { "--" },
            stats.packets_per_second,
            stats.packet_count,
            self.spectra
        );
        if let Some((min, max)) = self.last_range {
            line.push_str(&format!(", range {min:.2} ~ {max:.2}"));
        }
        if let Some((predictor, value)) = self.last_prediction {
            line.push_str(&format!(", predictor {predictor}: {value:.3}"));
        }
        for (label, progress, ready) in [
            ("black", stats.black, stats.has_black_reference),
            ("white", stats.white, stats.has_white_reference),
        ] {
            line.push_str(&format!(", {label} {}", reference_state(progress, ready)));
        }
        if let Some(message) = &self.last_message {
            line.push_str(&format!(" | {message}"));
        }
        line
    }
}

fn reference_state(progress: Option<Progress>, ready: bool) -> String {
    match progress {
        Some(Progress { count, total }) if total > 0 => {
            format!("{:.0}%", count as f64 * 100.0 / total as f64)
        }
        Some(_) => "0%".to_string(),
        None if ready => "ok".to_string(),
        None => "none".to_string(),
    }
}
