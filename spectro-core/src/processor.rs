//! # Spectrum Processor
//!
//! Averages live packets in batches (3950 by default), applies the
//! black/white correction when both references are present and runs the
//! selected predictor over the result.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::log_context::LogContext;
use crate::predictor::PredictorRegistry;
use crate::spectrum::{AveragedSpectrum, ReferenceKind, Spectrum, apply_correction, average_batch};
use crate::worker::Worker;

const SOURCE: &str = "processor";

#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    /// A processed batch. `spectrum` carries the final (possibly corrected)
    /// samples; `min` and `max` are computed on them.
    Ready {
        spectrum: AveragedSpectrum,
        min: f64,
        max: f64,
        batch_size: usize,
    },
    Prediction {
        predictor: usize,
        value: f64,
    },
}

/// Everything a batch computation reads, captured together with the batch.
#[derive(Clone, Default)]
struct Snapshot {
    black: Option<Arc<AveragedSpectrum>>,
    white: Option<Arc<AveragedSpectrum>>,
    predictor: Option<usize>,
}

#[derive(Default)]
struct State {
    batch: Vec<Spectrum>,
    snapshot: Snapshot,
    stop_requested: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

#[derive(Clone)]
struct Params {
    threshold: usize,
    spectrum_len: usize,
    epsilon: f64,
}

pub struct SpectrumProcessor {
    shared: Arc<Shared>,
    threshold: usize,
    join_timeout: Duration,
    log: LogContext,
    worker: Option<Worker>,
}

impl SpectrumProcessor {
    pub fn spawn<M>(
        config: &PipelineConfig,
        predictors: Arc<PredictorRegistry>,
        events: Sender<M>,
        log: LogContext,
    ) -> Result<Self>
    where
        M: From<ProcessorEvent> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        });
        let params = Params {
            threshold: config.spectrum_threshold,
            spectrum_len: config.spectrum_len,
            epsilon: config.correction_epsilon,
        };

        let worker = {
            let shared = shared.clone();
            let log = log.clone();
            Worker::spawn("spectrum-processor", move || {
                run(&shared, &params, &predictors, &events, &log)
            })?
        };

        Ok(Self {
            shared,
            threshold: config.spectrum_threshold,
            join_timeout: config.join_timeout(),
            log,
            worker: Some(worker),
        })
    }

    /// Queues a packet. Packets beyond a full batch stay queued and open the
    /// next one.
    pub fn add_spectrum(&self, spectrum: Spectrum) {
        let mut state = self.shared.state.lock();
        if state.stop_requested {
            return;
        }
        state.batch.push(spectrum);
        if state.batch.len() >= self.threshold {
            self.shared.wake.notify_one();
        }
    }

    pub fn set_reference(&self, kind: ReferenceKind, reference: Option<Arc<AveragedSpectrum>>) {
        let mut state = self.shared.state.lock();
        match kind {
            ReferenceKind::Black => state.snapshot.black = reference,
            ReferenceKind::White => state.snapshot.white = reference,
        }
    }

    pub fn set_predictor_index(&self, index: Option<usize>) {
        self.shared.state.lock().snapshot.predictor = index;
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().batch.len()
    }

    /// Ends the processing thread, discarding the partial batch.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            state.stop_requested = true;
            state.batch.clear();
            self.shared.wake.notify_all();
        }
        worker.join(self.join_timeout, &self.log);
    }
}

impl Drop for SpectrumProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<M: From<ProcessorEvent>>(
    shared: &Shared,
    params: &Params,
    predictors: &PredictorRegistry,
    events: &Sender<M>,
    log: &LogContext,
) {
    loop {
        let (batch, snapshot) = {
            let mut state = shared.state.lock();
            while !state.stop_requested && state.batch.len() < params.threshold {
                shared.wake.wait(&mut state);
            }
            if state.stop_requested {
                return;
            }
            let batch: Vec<Spectrum> = state.batch.drain(..params.threshold).collect();
            (batch, state.snapshot.clone())
        };

        let Some(processed) = process_batch(&batch, &snapshot, params, log) else {
            log.debug(
                SOURCE,
                format!("dropped batch of {} malformed packets", batch.len()),
            );
            continue;
        };

        let (min, max) = (processed.min, processed.max);
        let ready = ProcessorEvent::Ready {
            spectrum: processed.clone(),
            min,
            max,
            batch_size: batch.len(),
        };
        if events.send(ready.into()).is_err() {
            return;
        }

        if let Some(index) = snapshot.predictor {
            let value = predict(predictors, index, processed.samples(), log);
            let prediction = ProcessorEvent::Prediction {
                predictor: index,
                value,
            };
            if events.send(prediction.into()).is_err() {
                return;
            }
        }
    }
}

/// Averages a batch and corrects it against the snapshot's references.
fn process_batch(
    batch: &[Spectrum],
    snapshot: &Snapshot,
    params: &Params,
    log: &LogContext,
) -> Option<AveragedSpectrum> {
    let mean = average_batch(batch, params.spectrum_len)?;

    let references = match (&snapshot.black, &snapshot.white) {
        (Some(black), Some(white))
            if black.len() == params.spectrum_len && white.len() == params.spectrum_len =>
        {
            Some((black, white))
        }
        _ => None,
    };
    let Some((black, white)) = references else {
        return Some(mean);
    };

    let corrected = apply_correction(mean.samples(), black.samples(), white.samples(), params.epsilon);
    if corrected.fallbacks > 0 {
        log.debug(
            SOURCE,
            format!(
                "{} indices kept raw values: black/white span below {}",
                corrected.fallbacks, params.epsilon
            ),
        );
    }
    Some(AveragedSpectrum::from_samples(corrected.values, mean.contributors))
}

/// Runs the predictor, turning every failure, including a panic inside
/// the backend, into `0.0` and a warning.
fn predict(predictors: &PredictorRegistry, index: usize, samples: &[f64], log: &LogContext) -> f64 {
    match catch_unwind(AssertUnwindSafe(|| predictors.predict(index, samples))) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            log.warn(SOURCE, format!("prediction with predictor {index} failed: {e:#}"));
            0.0
        }
        Err(_) => {
            log.warn(SOURCE, format!("predictor {index} panicked"));
            0.0
        }
    }
}
