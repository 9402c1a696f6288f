//! # Reference Accumulator
//!
//! Collects a long exposure of spectra (39500 packets by default) for the
//! black or white calibration reference and averages it on its own thread.
//!
//! Each call to [`ReferenceAccumulator::start_accumulating`] yields at
//! most one reference: once the batch is full the accumulator averages it,
//! reports it and stops accepting data until it is started again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::log_context::LogContext;
use crate::spectrum::{AveragedSpectrum, ReferenceKind, Spectrum, average_batch};
use crate::worker::Worker;

const SOURCE: &str = "reference";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub enum ReferenceEvent {
    Progress {
        kind: ReferenceKind,
        id: u64,
        count: usize,
        total: usize,
    },
    Ready {
        kind: ReferenceKind,
        id: u64,
        spectrum: AveragedSpectrum,
    },
    /// The batch filled up but held no spectrum of the expected length.
    Failed {
        kind: ReferenceKind,
        id: u64,
        reason: String,
    },
}

struct Shared {
    state: Mutex<BatchState>,
    wake: Condvar,
}

#[derive(Default)]
struct BatchState {
    batch: Vec<Spectrum>,
    accumulating: bool,
    stop_requested: bool,
}

pub struct ReferenceAccumulator<M = ReferenceEvent> {
    kind: ReferenceKind,
    id: u64,
    threshold: usize,
    shared: Arc<Shared>,
    events: Sender<M>,
    join_timeout: Duration,
    log: LogContext,
    worker: Option<Worker>,
}

impl<M> ReferenceAccumulator<M>
where
    M: From<ReferenceEvent> + Send + 'static,
{
    /// Starts the averaging thread. The accumulator is idle until
    /// [`start_accumulating`](Self::start_accumulating) is called.
    pub fn spawn(kind: ReferenceKind, config: &PipelineConfig, events: Sender<M>, log: LogContext) -> Result<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let threshold = config.reference_threshold;
        let spectrum_len = config.spectrum_len;
        let shared = Arc::new(Shared {
            state: Mutex::new(BatchState::default()),
            wake: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            let events = events.clone();
            let log = log.clone();
            Worker::spawn("reference-accumulator", move || {
                run(&shared, kind, id, threshold, spectrum_len, &events, &log)
            })?
        };

        Ok(Self {
            kind,
            id,
            threshold,
            shared,
            events,
            join_timeout: config.join_timeout(),
            log,
            worker: Some(worker),
        })
    }

    /// Appends a spectrum while accumulating and the batch has room.
    ///
    /// Returns whether the spectrum was taken.
    pub fn add_spectrum(&self, spectrum: Spectrum) -> bool {
        let count = {
            let mut state = self.shared.state.lock();
            if !state.accumulating || state.batch.len() >= self.threshold {
                return false;
            }
            state.batch.push(spectrum);
            let count = state.batch.len();
            if count >= self.threshold {
                self.shared.wake.notify_one();
            }
            count
        };
        let _ = self.events.send(
            ReferenceEvent::Progress {
                kind: self.kind,
                id: self.id,
                count,
                total: self.threshold,
            }
            .into(),
        );
        true
    }
}

impl<M> ReferenceAccumulator<M> {
    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    /// Identifies this accumulator in the events it sends.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Begins a fresh batch, discarding anything collected before.
    pub fn start_accumulating(&self) {
        let mut state = self.shared.state.lock();
        state.batch.clear();
        state.accumulating = true;
        self.shared.wake.notify_one();
    }

    /// Stops collecting and throws the partial batch away.
    pub fn stop_accumulating(&self) {
        let mut state = self.shared.state.lock();
        state.accumulating = false;
        state.batch.clear();
    }

    pub fn is_accumulating(&self) -> bool {
        self.shared.state.lock().accumulating
    }

    pub fn accumulated_count(&self) -> usize {
        self.shared.state.lock().batch.len()
    }

    /// Ends the averaging thread. Any partial batch is discarded.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            state.stop_requested = true;
            state.accumulating = false;
            state.batch.clear();
            self.shared.wake.notify_all();
        }
        worker.join(self.join_timeout, &self.log);
    }
}

impl<M> Drop for ReferenceAccumulator<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<M: From<ReferenceEvent>>(
    shared: &Shared,
    kind: ReferenceKind,
    id: u64,
    threshold: usize,
    spectrum_len: usize,
    events: &Sender<M>,
    log: &LogContext,
) {
    loop {
        let mut state = shared.state.lock();
        while !state.stop_requested && !(state.accumulating && state.batch.len() >= threshold) {
            shared.wake.wait(&mut state);
        }
        if state.stop_requested {
            break;
        }

        let batch = std::mem::take(&mut state.batch);
        state.accumulating = false;
        drop(state);

        let event = match average_batch(&batch, spectrum_len) {
            Some(spectrum) => {
                log.info(
                    SOURCE,
                    format!(
                        "{kind} reference ready from {} of {} packets, range {:.2} ~ {:.2}",
                        spectrum.contributors,
                        batch.len(),
                        spectrum.min,
                        spectrum.max
                    ),
                );
                ReferenceEvent::Ready { kind, id, spectrum }
            }
            None => {
                let reason = format!(
                    "none of {} packets had {spectrum_len} samples",
                    batch.len()
                );
                log.warn(SOURCE, format!("{kind} reference discarded: {reason}"));
                ReferenceEvent::Failed { kind, id, reason }
            }
        };
        if events.send(event.into()).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;

    const LEN: usize = 3;

    fn config(threshold: usize) -> PipelineConfig {
        PipelineConfig {
            spectrum_len: LEN,
            reference_threshold: threshold,
            ..PipelineConfig::default()
        }
    }

    fn accumulator(
        kind: ReferenceKind,
        threshold: usize,
    ) -> (ReferenceAccumulator, Receiver<ReferenceEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let acc = ReferenceAccumulator::spawn(kind, &config(threshold), tx, LogContext::in_memory(64)).unwrap();
        (acc, rx)
    }

    fn constant(value: f64) -> Spectrum {
        Spectrum::new(vec![value; LEN])
    }

    fn wait_terminal(rx: &Receiver<ReferenceEvent>) -> ReferenceEvent {
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).expect("no reference event");
            if !matches!(event, ReferenceEvent::Progress { .. }) {
                return event;
            }
        }
    }

    fn drain_terminal(rx: &Receiver<ReferenceEvent>, wait: Duration) -> usize {
        std::thread::sleep(wait);
        rx.try_iter()
            .filter(|e| !matches!(e, ReferenceEvent::Progress { .. }))
            .count()
    }

    #[test]
    fn ignores_data_until_started() {
        let (acc, rx) = accumulator(ReferenceKind::Black, 4);
        assert!(!acc.add_spectrum(constant(1.0)));
        assert_eq!(acc.accumulated_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn threshold_boundary_emits_exactly_once() {
        let (acc, rx) = accumulator(ReferenceKind::White, 4);
        acc.start_accumulating();
        for i in 0..3 {
            assert!(acc.add_spectrum(constant(i as f64)));
        }
        assert_eq!(drain_terminal(&rx, Duration::from_millis(50)), 0);
        assert_eq!(acc.accumulated_count(), 3);

        assert!(acc.add_spectrum(constant(3.0)));
        match wait_terminal(&rx) {
            ReferenceEvent::Ready { kind, id, spectrum } => {
                assert_eq!(kind, ReferenceKind::White);
                assert_eq!(id, acc.id());
                assert_eq!(spectrum.samples(), &[1.5, 1.5, 1.5]);
                assert_eq!((spectrum.min, spectrum.max), (1.5, 1.5));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(acc.accumulated_count(), 0);
        assert!(!acc.is_accumulating());
        // One-shot: more data is refused until restarted.
        assert!(!acc.add_spectrum(constant(9.0)));
        assert_eq!(drain_terminal(&rx, Duration::from_millis(50)), 0);
    }

    #[test]
    fn progress_counts_up_to_the_threshold() {
        let (acc, rx) = accumulator(ReferenceKind::Black, 3);
        acc.start_accumulating();
        for _ in 0..3 {
            acc.add_spectrum(constant(2.0));
        }
        let progress: Vec<(usize, usize)> = (0..3)
            .map(|_| match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                ReferenceEvent::Progress { count, total, .. } => (count, total),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn stop_accumulating_discards_the_partial_batch() {
        let (acc, rx) = accumulator(ReferenceKind::Black, 4);
        acc.start_accumulating();
        acc.add_spectrum(constant(100.0));
        acc.add_spectrum(constant(100.0));
        acc.stop_accumulating();
        assert_eq!(acc.accumulated_count(), 0);
        assert_eq!(drain_terminal(&rx, Duration::from_millis(50)), 0);

        acc.start_accumulating();
        assert_eq!(acc.accumulated_count(), 0);
        for _ in 0..4 {
            acc.add_spectrum(constant(2.0));
        }
        match wait_terminal(&rx) {
            ReferenceEvent::Ready { spectrum, .. } => assert_eq!(spectrum.samples(), &[2.0; LEN]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_spectra_are_skipped_in_the_mean() {
        let (acc, rx) = accumulator(ReferenceKind::Black, 3);
        acc.start_accumulating();
        acc.add_spectrum(Spectrum::new(vec![1.0, 2.0, 3.0]));
        acc.add_spectrum(Spectrum::new(vec![500.0]));
        acc.add_spectrum(Spectrum::new(vec![3.0, 4.0, 5.0]));
        match wait_terminal(&rx) {
            ReferenceEvent::Ready { spectrum, .. } => {
                assert_eq!(spectrum.samples(), &[2.0, 3.0, 4.0]);
                assert_eq!(spectrum.contributors, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn all_malformed_batch_fails() {
        let (acc, rx) = accumulator(ReferenceKind::White, 2);
        acc.start_accumulating();
        acc.add_spectrum(Spectrum::new(vec![1.0]));
        acc.add_spectrum(Spectrum::new(vec![1.0, 2.0]));
        assert!(matches!(wait_terminal(&rx), ReferenceEvent::Failed { .. }));
    }

    #[test]
    fn stop_is_bounded_and_idempotent() {
        let (mut acc, _rx) = accumulator(ReferenceKind::Black, 100);
        acc.start_accumulating();
        acc.add_spectrum(constant(1.0));
        let started = std::time::Instant::now();
        acc.stop();
        acc.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!acc.is_accumulating());
        assert!(!acc.add_spectrum(constant(1.0)));
    }
}
