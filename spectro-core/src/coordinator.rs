//! # Session Coordinator
//!
//! Owns the receiving session and routes every packet to the spectrum
//! processor and to whichever reference accumulators are collecting.
//!
//! ## Threads
//! All component events funnel into one inbox drained by a dispatch
//! thread. The dispatcher also drives the packets-per-second ticker and
//! forwards what outside code cares about as [`SessionEvent`]s.
//!
//! ## Lifetimes
//! The receiver and processor live and die together with the session.
//! References and the selected predictor belong to the [`Calibration`],
//! which outlives sessions and is handed to every new processor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::log_context::LogContext;
use crate::predictor::PredictorRegistry;
use crate::processor::{ProcessorEvent, SpectrumProcessor};
use crate::receiver::{PacketReceiver, ReceiverEvent};
use crate::reference::{ReferenceAccumulator, ReferenceEvent};
use crate::spectrum::{AveragedSpectrum, ReferenceKind, Spectrum};
use crate::worker::Worker;

const SOURCE: &str = "coordinator";

/// What the coordinator reports to displays, loggers and file sinks.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(String),
    Error(String),
    ReceivingChanged(bool),
    SpectrumReady {
        spectrum: AveragedSpectrum,
        min: f64,
        max: f64,
        batch_size: usize,
    },
    Prediction {
        predictor: usize,
        value: f64,
    },
    ReferenceProgress {
        kind: ReferenceKind,
        progress: Progress,
    },
    ReferenceReady {
        kind: ReferenceKind,
        spectrum: Arc<AveragedSpectrum>,
    },
    ReferenceAccumulatingChanged {
        kind: ReferenceKind,
        accumulating: bool,
    },
    PacketsPerSecond(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub count: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    /// Packets received since the last reset.
    pub packet_count: u64,
    /// Packets counted in the last completed rate window.
    pub packets_per_second: u64,
    pub receiving: bool,
    pub black: Option<Progress>,
    pub white: Option<Progress>,
    pub has_black_reference: bool,
    pub has_white_reference: bool,
}

/// Packet counter with a per-window rate.
///
/// [`tick`](Self::tick) publishes the count since the previous tick and
/// starts a new window, so the rate follows bursts and idle periods
/// instead of averaging over the whole session.
#[derive(Debug, Default)]
pub struct ThroughputCounter {
    total: AtomicU64,
    window: AtomicU64,
    rate: AtomicU64,
}

impl ThroughputCounter {
    pub fn record(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.window.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes the current window and returns its count.
    pub fn tick(&self) -> u64 {
        let count = self.window.swap(0, Ordering::Relaxed);
        self.rate.store(count, Ordering::Relaxed);
        count
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.window.store(0, Ordering::Relaxed);
        self.rate.store(0, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }
}

/// Whether a progress step deserves a status line.
fn should_report(progress: Progress, interval: usize) -> bool {
    progress.count == progress.total || progress.count % interval.max(1) == 0
}

enum Inbound {
    Receiver(ReceiverEvent),
    Processor(ProcessorEvent),
    Reference(ReferenceEvent),
}

impl From<ReceiverEvent> for Inbound {
    fn from(event: ReceiverEvent) -> Self {
        Inbound::Receiver(event)
    }
}

impl From<ProcessorEvent> for Inbound {
    fn from(event: ProcessorEvent) -> Self {
        Inbound::Processor(event)
    }
}

impl From<ReferenceEvent> for Inbound {
    fn from(event: ReferenceEvent) -> Self {
        Inbound::Reference(event)
    }
}

/// References and predictor selection, kept across sessions.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    pub black: Option<Arc<AveragedSpectrum>>,
    pub white: Option<Arc<AveragedSpectrum>>,
    pub predictor: Option<usize>,
}

impl Calibration {
    pub fn reference(&self, kind: ReferenceKind) -> Option<&Arc<AveragedSpectrum>> {
        match kind {
            ReferenceKind::Black => self.black.as_ref(),
            ReferenceKind::White => self.white.as_ref(),
        }
    }

    fn set_reference(&mut self, kind: ReferenceKind, spectrum: Arc<AveragedSpectrum>) {
        match kind {
            ReferenceKind::Black => self.black = Some(spectrum),
            ReferenceKind::White => self.white = Some(spectrum),
        }
    }

    fn apply_to(&self, processor: &SpectrumProcessor) {
        for kind in ReferenceKind::ALL {
            processor.set_reference(kind, self.reference(kind).cloned());
        }
        processor.set_predictor_index(self.predictor);
    }
}

#[derive(Default)]
struct Session {
    receiver: Option<PacketReceiver>,
    processor: Option<SpectrumProcessor>,
    accumulators: HashMap<ReferenceKind, ReferenceAccumulator<Inbound>>,
    progress: HashMap<ReferenceKind, Progress>,
}

impl Session {
    fn is_receiving(&self) -> bool {
        self.receiver.as_ref().is_some_and(PacketReceiver::is_running)
    }

    /// Detaches the receiver and processor so they can be stopped without
    /// holding the session lock.
    fn take_pipeline(&mut self) -> Option<(PacketReceiver, Option<SpectrumProcessor>)> {
        let receiver = self.receiver.take()?;
        Some((receiver, self.processor.take()))
    }

    /// Looks up the accumulator an event came from; `None` for events of an
    /// accumulator that has since been replaced or stopped.
    fn accumulator(&self, kind: ReferenceKind, id: u64) -> Option<&ReferenceAccumulator<Inbound>> {
        self.accumulators.get(&kind).filter(|acc| acc.id() == id)
    }

    fn finish_accumulator(&mut self, kind: ReferenceKind) -> Option<ReferenceAccumulator<Inbound>> {
        self.progress.remove(&kind);
        self.accumulators.remove(&kind)
    }
}

struct Shared {
    config: PipelineConfig,
    predictors: Arc<PredictorRegistry>,
    log: LogContext,
    session: Mutex<Session>,
    calibration: Mutex<Calibration>,
    throughput: ThroughputCounter,
    inbox: Sender<Inbound>,
    events: Sender<SessionEvent>,
}

pub struct SessionCoordinator {
    shared: Arc<Shared>,
    events: Receiver<SessionEvent>,
    shutdown: Sender<()>,
    dispatcher: Option<Worker>,
}

impl SessionCoordinator {
    pub fn new(config: PipelineConfig, predictors: Arc<PredictorRegistry>, log: LogContext) -> Result<Self> {
        let (inbox, inbox_rx) = crossbeam_channel::unbounded();
        let (events_tx, events) = crossbeam_channel::unbounded();
        let (shutdown, shutdown_rx) = crossbeam_channel::bounded(1);

        let shared = Arc::new(Shared {
            config,
            predictors,
            log,
            session: Mutex::new(Session::default()),
            calibration: Mutex::new(Calibration::default()),
            throughput: ThroughputCounter::default(),
            inbox,
            events: events_tx,
        });

        let dispatcher = {
            let shared = shared.clone();
            Worker::spawn("session-dispatch", move || dispatch(&shared, &inbox_rx, &shutdown_rx))?
        };

        Ok(Self {
            shared,
            events,
            shutdown,
            dispatcher: Some(dispatcher),
        })
    }

    /// Event stream for outside consumers. Every clone competes for the
    /// same events, so use one consumer.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn predictors(&self) -> &Arc<PredictorRegistry> {
        &self.shared.predictors
    }

    /// Starts receiving on `bind_address:port` with a fresh processor.
    pub fn start(&self, port: u16, bind_address: &str) -> Result<SocketAddr> {
        let shared = &self.shared;
        let mut session = shared.session.lock();
        if session.is_receiving() {
            shared.status("UDP receiving is already running");
            return Err(Error::AlreadyRunning);
        }
        // Leftovers of a session that ended on a receiver error.
        let stale = session.take_pipeline();

        let processor = SpectrumProcessor::spawn(
            &shared.config,
            shared.predictors.clone(),
            shared.inbox.clone(),
            shared.log.clone(),
        )?;
        shared.calibration.lock().apply_to(&processor);

        let mut receiver = PacketReceiver::new(&shared.config, shared.log.clone());
        let addr = receiver.start(port, bind_address, shared.inbox.clone())?;

        session.receiver = Some(receiver);
        session.processor = Some(processor);
        drop(session);
        drop(stale);

        shared.emit(SessionEvent::ReceivingChanged(true));
        Ok(addr)
    }

    /// Stops receiving and discards the processor's partial batch.
    /// Reference accumulators and calibration are left alone.
    pub fn stop(&self) {
        let pipeline = self.shared.session.lock().take_pipeline();
        if let Some((receiver, processor)) = pipeline {
            drop(receiver);
            drop(processor);
            self.shared.emit(SessionEvent::ReceivingChanged(false));
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.shared.session.lock().is_receiving()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .session
            .lock()
            .receiver
            .as_ref()
            .and_then(PacketReceiver::local_addr)
    }

    /// Selects the predictor run on each processed spectrum, or none.
    pub fn set_predictor_index(&self, index: Option<usize>) -> Result<()> {
        let shared = &self.shared;
        if let Some(i) = index {
            if i >= shared.predictors.len() {
                return Err(Error::PredictorIndex(i));
            }
            if !shared.predictors.is_loaded(i) {
                shared.log.warn(SOURCE, format!("predictor {i} selected without a model"));
            }
        }
        let session = shared.session.lock();
        shared.calibration.lock().predictor = index;
        if let Some(processor) = &session.processor {
            processor.set_predictor_index(index);
        }
        Ok(())
    }

    pub fn predictor_index(&self) -> Option<usize> {
        self.shared.calibration.lock().predictor
    }

    /// Starts collecting a reference from the live packet stream.
    pub fn start_reference(&self, kind: ReferenceKind) -> Result<()> {
        let shared = &self.shared;
        let mut session = shared.session.lock();
        if !session.is_receiving() {
            shared.status(format!("start UDP receiving before collecting the {kind} reference"));
            return Err(Error::NotReceiving);
        }
        if session.accumulators.contains_key(&kind) {
            return Err(Error::AlreadyAccumulating(kind));
        }

        let accumulator =
            ReferenceAccumulator::spawn(kind, &shared.config, shared.inbox.clone(), shared.log.clone())?;
        accumulator.start_accumulating();
        let progress = Progress {
            count: 0,
            total: accumulator.threshold(),
        };
        session.progress.insert(kind, progress);
        session.accumulators.insert(kind, accumulator);
        drop(session);

        shared.status(format!("collecting {kind} reference: 0/{}", progress.total));
        shared.emit(SessionEvent::ReferenceAccumulatingChanged {
            kind,
            accumulating: true,
        });
        Ok(())
    }

    /// Cancels a running reference collection; the partial batch is lost.
    pub fn stop_reference(&self, kind: ReferenceKind) {
        let accumulator = self.shared.session.lock().finish_accumulator(kind);
        if let Some(accumulator) = accumulator {
            drop(accumulator);
            self.shared.status(format!("{kind} reference collection cancelled"));
            self.shared.emit(SessionEvent::ReferenceAccumulatingChanged {
                kind,
                accumulating: false,
            });
        }
    }

    pub fn is_accumulating(&self, kind: ReferenceKind) -> bool {
        self.shared.session.lock().accumulators.contains_key(&kind)
    }

    pub fn reference(&self, kind: ReferenceKind) -> Option<Arc<AveragedSpectrum>> {
        self.shared.calibration.lock().reference(kind).cloned()
    }

    /// Installs a reference from outside, typically one loaded from disk.
    pub fn set_reference(&self, kind: ReferenceKind, spectrum: AveragedSpectrum) -> Result<()> {
        let expected = self.shared.config.spectrum_len;
        if spectrum.len() != expected {
            return Err(Error::ReferenceLength {
                kind,
                expected,
                actual: spectrum.len(),
            });
        }
        self.shared.install_reference(kind, Arc::new(spectrum));
        self.shared.status(format!("{kind} reference imported"));
        Ok(())
    }

    pub fn calibration(&self) -> Calibration {
        self.shared.calibration.lock().clone()
    }

    pub fn reset_packet_count(&self) {
        self.shared.throughput.reset();
    }

    pub fn stats(&self) -> SessionStats {
        let shared = &self.shared;
        let (receiving, black, white) = {
            let session = shared.session.lock();
            (
                session.is_receiving(),
                session.progress.get(&ReferenceKind::Black).copied(),
                session.progress.get(&ReferenceKind::White).copied(),
            )
        };
        let calibration = shared.calibration.lock();
        SessionStats {
            packet_count: shared.throughput.total(),
            packets_per_second: shared.throughput.rate(),
            receiving,
            black,
            white,
            has_black_reference: calibration.black.is_some(),
            has_white_reference: calibration.white.is_some(),
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.stop();
        let accumulators = std::mem::take(&mut self.shared.session.lock().accumulators);
        drop(accumulators);
        let _ = self.shutdown.send(());
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.join(self.shared.config.join_timeout(), &self.shared.log);
        }
    }
}

fn dispatch(shared: &Shared, inbox: &Receiver<Inbound>, shutdown: &Receiver<()>) {
    let ticker = crossbeam_channel::tick(shared.config.rate_window());
    loop {
        select! {
            recv(inbox) -> message => match message {
                Ok(message) => shared.handle(message),
                Err(_) => break,
            },
            recv(ticker) -> _ => shared.on_tick(),
            recv(shutdown) -> _ => break,
        }
    }
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        self.log.info(SOURCE, message.clone());
        self.emit(SessionEvent::Status(message));
    }

    fn handle(&self, message: Inbound) {
        match message {
            Inbound::Receiver(ReceiverEvent::Packet { session, spectrum }) => self.route(session, spectrum),
            Inbound::Receiver(ReceiverEvent::Status(message)) => {
                self.emit(SessionEvent::Status(message));
            }
            Inbound::Receiver(ReceiverEvent::Error(message)) => self.on_receiver_error(message),
            Inbound::Processor(ProcessorEvent::Ready {
                spectrum,
                min,
                max,
                batch_size,
            }) => self.emit(SessionEvent::SpectrumReady {
                spectrum,
                min,
                max,
                batch_size,
            }),
            Inbound::Processor(ProcessorEvent::Prediction { predictor, value }) => {
                self.emit(SessionEvent::Prediction { predictor, value });
            }
            Inbound::Reference(event) => self.on_reference(event),
        }
    }

    fn route(&self, id: u64, spectrum: Spectrum) {
        let session = self.session.lock();
        // Packets still queued from a stopped receiver belong to no batch.
        if session.receiver.as_ref().and_then(PacketReceiver::session) != Some(id) {
            return;
        }
        let Some(processor) = &session.processor else {
            return;
        };
        self.throughput.record();
        processor.add_spectrum(spectrum.clone());
        for accumulator in session.accumulators.values() {
            accumulator.add_spectrum(spectrum.clone());
        }
    }

    fn on_tick(&self) {
        let rate = self.throughput.tick();
        if self.session.lock().is_receiving() {
            self.emit(SessionEvent::PacketsPerSecond(rate));
        }
    }

    fn on_receiver_error(&self, message: String) {
        self.emit(SessionEvent::Error(message));
        let pipeline = {
            let mut session = self.session.lock();
            let dead = session
                .receiver
                .as_ref()
                .is_some_and(|receiver| !receiver.is_running());
            if dead { session.take_pipeline() } else { None }
        };
        if let Some((receiver, processor)) = pipeline {
            drop(receiver);
            drop(processor);
            self.log.warn(SOURCE, "receiving session ended after a receiver error");
            self.emit(SessionEvent::ReceivingChanged(false));
        }
    }

    fn on_reference(&self, event: ReferenceEvent) {
        match event {
            ReferenceEvent::Progress {
                kind,
                id,
                count,
                total,
            } => {
                let progress = Progress { count, total };
                {
                    let mut session = self.session.lock();
                    if session.accumulator(kind, id).is_none() {
                        return;
                    }
                    session.progress.insert(kind, progress);
                }
                if should_report(progress, self.config.progress_report_interval) {
                    self.status(format!("collecting {kind} reference: {count}/{total}"));
                }
                self.emit(SessionEvent::ReferenceProgress { kind, progress });
            }
            ReferenceEvent::Ready { kind, id, spectrum } => {
                let Some(accumulator) = self.finish(kind, id) else {
                    return;
                };
                drop(accumulator);
                let (min, max) = (spectrum.min, spectrum.max);
                let spectrum = Arc::new(spectrum);
                self.install_reference(kind, spectrum.clone());
                self.status(format!("{kind} reference ready, range {min:.2} ~ {max:.2}"));
                self.emit(SessionEvent::ReferenceReady { kind, spectrum });
                self.emit(SessionEvent::ReferenceAccumulatingChanged {
                    kind,
                    accumulating: false,
                });
            }
            ReferenceEvent::Failed { kind, id, reason } => {
                let Some(accumulator) = self.finish(kind, id) else {
                    return;
                };
                drop(accumulator);
                self.log.warn(SOURCE, format!("{kind} reference failed: {reason}"));
                self.emit(SessionEvent::Error(format!("{kind} reference failed: {reason}")));
                self.emit(SessionEvent::ReferenceAccumulatingChanged {
                    kind,
                    accumulating: false,
                });
            }
        }
    }

    fn finish(&self, kind: ReferenceKind, id: u64) -> Option<ReferenceAccumulator<Inbound>> {
        let mut session = self.session.lock();
        session.accumulator(kind, id)?;
        session.finish_accumulator(kind)
    }

    /// Stores a reference and hands it to the live processor, if any.
    fn install_reference(&self, kind: ReferenceKind, spectrum: Arc<AveragedSpectrum>) {
        let session = self.session.lock();
        self.calibration.lock().set_reference(kind, spectrum.clone());
        if let Some(processor) = &session.processor {
            processor.set_reference(kind, Some(spectrum));
        }
    }
}
