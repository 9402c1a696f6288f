//! # Spectro Host
//!
//! Headless front end for the spectral ingest pipeline. It receives sensor
//! packets over UDP, collects black/white references on request, and writes
//! references, predictions and recorded spectra to disk.
//!
//! ## Architecture
//! - **Main Thread**: event loop over session events and a report ticker
//! - **Pipeline Threads**: owned by the `SessionCoordinator` in `spectro-core`
//! - **Communication**: crossbeam channels; every input becomes a [`Message`]
//! - **Shutdown**: SIGINT/SIGTERM or `--duration`

mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use crossbeam_channel::select;
use serial2::SerialPort;
use spectro_core::persist::{self, PredictionEntry, PredictionLog, SpectrumRecord};
use spectro_core::predictor::{LimitMonitor, PredictorRegistry};
use spectro_core::trigger::{TRIGGER_BAUD_RATE, ToggleTrigger};
use spectro_core::{AveragedSpectrum, LogContext, PipelineConfig, ReferenceKind, SessionCoordinator, SessionEvent};

use report::StatusLine;

const SOURCE: &str = "host";

#[derive(Parser, Debug)]
#[command(name = "spectro-host", version, about = "Receive, average and correct UDP spectra")]
struct Args {
    /// JSON pipeline configuration; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration to this file and continue.
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// UDP port, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Local address to bind; empty means every interface.
    #[arg(short, long)]
    bind: Option<String>,

    /// Predictor index to run on every processed spectrum.
    #[arg(long)]
    predictor: Option<usize>,

    /// Look for each predictor's default model next to the executable.
    #[arg(long)]
    auto_model: bool,

    /// Import a black reference exported earlier.
    #[arg(long)]
    black: Option<PathBuf>,

    /// Import a white reference exported earlier.
    #[arg(long)]
    white: Option<PathBuf>,

    /// Collect references from the live stream: `black`, `white` or both.
    #[arg(long, value_parser = parse_kind)]
    collect: Vec<ReferenceKind>,

    /// Directory completed references are exported to.
    #[arg(long, default_value = "references")]
    export_dir: PathBuf,

    /// Append every prediction to this CSV file.
    #[arg(long)]
    prediction_log: Option<PathBuf>,

    /// Lower limit for flagging predictions; needs `--upper-limit`.
    #[arg(long, requires = "upper_limit")]
    lower_limit: Option<f64>,

    /// Upper limit for flagging predictions; needs `--lower-limit`.
    #[arg(long, requires = "lower_limit")]
    upper_limit: Option<f64>,

    /// Keep every processed spectrum and write them as a table on exit.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Serial device that toggles sensor acquisition.
    #[arg(long)]
    serial: Option<String>,

    /// Stop after this many seconds.
    #[arg(long)]
    duration: Option<u64>,

    /// Milliseconds between status lines.
    #[arg(long, default_value_t = 1000)]
    report_interval_ms: u64,
}

fn parse_kind(value: &str) -> std::result::Result<ReferenceKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "black" => Ok(ReferenceKind::Black),
        "white" => Ok(ReferenceKind::White),
        other => Err(format!("unknown reference {other:?}, expected black or white")),
    }
}

/// Inputs to [`HostApp::update`].
#[derive(Debug)]
enum Message {
    Session(SessionEvent),
    Tick,
    Exit,
}

struct HostApp {
    coordinator: SessionCoordinator,
    log: LogContext,
    wavelength_range: (f64, f64),
    export_dir: PathBuf,
    trigger: Option<ToggleTrigger<SerialPort>>,
    prediction_log: Option<PredictionLog>,
    monitor: LimitMonitor,
    records: Option<(PathBuf, Vec<SpectrumRecord>)>,
    last_spectrum: Option<AveragedSpectrum>,
    status: StatusLine,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    log::info!("spectro-host {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
    }

    let mut app = HostApp::new(&args, config)?;
    let events = app.coordinator.events();

    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, terminate.clone()).context("installing signal handler")?;
    }
    let ticker = crossbeam_channel::tick(Duration::from_millis(args.report_interval_ms.max(1)));
    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));

    loop {
        let message = select! {
            recv(events) -> event => match event {
                Ok(event) => Message::Session(event),
                Err(_) => Message::Exit,
            },
            recv(ticker) -> _ => Message::Tick,
        };
        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        let message = if terminate.load(Ordering::Relaxed) || expired {
            log::info!("exit requested");
            Message::Exit
        } else {
            message
        };
        if !app.update(message) {
            break;
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    config.validate()?;
    Ok(config)
}

impl HostApp {
    fn new(args: &Args, config: PipelineConfig) -> Result<Self> {
        let log_file = config
            .log_dir
            .join(format!("spectro_{}.log", Local::now().format("%Y%m%d")));
        let log = LogContext::new(config.log_capacity, Some(&log_file))
            .with_context(|| format!("opening log file {}", log_file.display()))?;
        log.info(SOURCE, format!("logging to {}", log_file.display()));

        let predictors = Arc::new(PredictorRegistry::from_config(&config.predictors, log.clone()));
        if args.auto_model {
            for index in 0..predictors.len() {
                match predictors.load_model_auto(index) {
                    Ok(path) => log.info(SOURCE, format!("predictor {index}: model {}", path.display())),
                    Err(e) => log.warn(SOURCE, format!("predictor {index}: {e:#}")),
                }
            }
        }

        let wavelength_range = (config.wavelength_start_nm, config.wavelength_end_nm);
        let spectrum_len = config.spectrum_len;
        let (port, bind) = (config.port, config.bind_address.clone());

        let prediction_log = args
            .prediction_log
            .as_deref()
            .map(|path| PredictionLog::open(path, spectrum_len, wavelength_range))
            .transpose()?;
        let monitor = match (args.lower_limit, args.upper_limit) {
            (Some(lower), Some(upper)) => LimitMonitor::new(lower, upper),
            _ => LimitMonitor::default(),
        };

        let mut trigger = match &args.serial {
            Some(device) => {
                let port = SerialPort::open(device, TRIGGER_BAUD_RATE)
                    .with_context(|| format!("opening serial port {device}"))?;
                Some(ToggleTrigger::new(port))
            }
            None => None,
        };

        let coordinator = SessionCoordinator::new(config, predictors, log.clone())?;
        for (kind, path) in [(ReferenceKind::Black, &args.black), (ReferenceKind::White, &args.white)] {
            if let Some(path) = path {
                import_reference(&coordinator, kind, path, &log)?;
            }
        }
        if args.predictor.is_some() {
            coordinator.set_predictor_index(args.predictor)?;
        }
        let addr = coordinator.start(port, &bind)?;
        log.info(SOURCE, format!("listening on {addr}"));
        for kind in &args.collect {
            coordinator.start_reference(*kind)?;
        }
        if let Some(trigger) = trigger.as_mut() {
            trigger.start()?;
            log.info(SOURCE, "acquisition trigger sent");
        }

        Ok(Self {
            coordinator,
            log,
            wavelength_range,
            export_dir: args.export_dir.clone(),
            trigger,
            prediction_log,
            monitor,
            records: args.record.clone().map(|path| (path, Vec::new())),
            last_spectrum: None,
            status: StatusLine::default(),
        })
    }

    /// Handles one message; returns `false` once the host should exit.
    fn update(&mut self, message: Message) -> bool {
        match message {
            Message::Session(event) => self.process_session_event(event),
            Message::Tick => {
                println!("{}", self.status.render(&self.coordinator.stats()));
            }
            Message::Exit => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn process_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Status(message) => self.status.record_message(message),
            SessionEvent::Error(message) => {
                self.log.error(SOURCE, message.clone());
                self.status.record_message(message);
            }
            SessionEvent::ReceivingChanged(receiving) => {
                self.log.info(SOURCE, format!("receiving: {receiving}"));
            }
            SessionEvent::SpectrumReady {
                spectrum,
                min,
                max,
                batch_size,
            } => {
                self.log.debug(
                    SOURCE,
                    format!("spectrum from {batch_size} packets, range {min:.4} ~ {max:.4}"),
                );
                self.status.record_spectrum(min, max);
                if let Some((_, records)) = self.records.as_mut() {
                    let index = records.len() as i64;
                    records.push(SpectrumRecord::new(index, "", Local::now(), &spectrum, 0.0));
                }
                self.last_spectrum = Some(spectrum);
            }
            SessionEvent::Prediction { predictor, value } => {
                self.status.record_prediction(predictor, value);
                if let Some(record) = self.records.as_mut().and_then(|(_, r)| r.last_mut()) {
                    record.moisture = value;
                }
                self.log_prediction(predictor, value);
            }
            SessionEvent::ReferenceReady { kind, spectrum } => {
                if let Err(e) = self.export_reference(kind, spectrum.samples()) {
                    self.log.error(SOURCE, format!("{e:#}"));
                }
            }
            SessionEvent::ReferenceAccumulatingChanged { kind, accumulating } => {
                self.log.debug(SOURCE, format!("{kind} accumulating: {accumulating}"));
            }
            SessionEvent::ReferenceProgress { .. } | SessionEvent::PacketsPerSecond(_) => {}
        }
    }

    fn log_prediction(&mut self, predictor: usize, value: f64) {
        let Some(prediction_log) = self.prediction_log.as_mut() else {
            return;
        };
        let entry = PredictionEntry {
            time: Local::now(),
            predictor,
            value,
            monitor: self.monitor,
            spectrum: self.last_spectrum.as_ref().map(|s| s.samples()).unwrap_or(&[]),
        };
        if let Err(e) = prediction_log.append(&entry) {
            self.log.error(SOURCE, format!("{e:#}"));
        }
    }

    fn export_reference(&self, kind: ReferenceKind, samples: &[f64]) -> Result<()> {
        std::fs::create_dir_all(&self.export_dir)
            .with_context(|| format!("creating {}", self.export_dir.display()))?;
        let path = self.export_dir.join(format!(
            "{kind}_reference_{}.csv",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        persist::save_spectrum_csv(&path, samples)?;
        self.log.info(SOURCE, format!("{kind} reference saved to {}", path.display()));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.log.info(SOURCE, "shutting down");
        self.coordinator.stop();
        for kind in ReferenceKind::ALL {
            self.coordinator.stop_reference(kind);
        }

        if let Some(trigger) = self.trigger.as_mut() {
            if let Err(e) = trigger.stop() {
                self.log.warn(SOURCE, format!("{e:#}"));
            }
        }

        if let Some((path, records)) = self.records.take() {
            match persist::save_records_csv(&path, &records, self.wavelength_range) {
                Ok(()) => self.log.info(
                    SOURCE,
                    format!("{} spectra saved to {}", records.len(), path.display()),
                ),
                Err(e) => self.log.error(SOURCE, format!("{e:#}")),
            }
        }
    }
}

fn import_reference(
    coordinator: &SessionCoordinator,
    kind: ReferenceKind,
    path: &Path,
    log: &LogContext,
) -> Result<()> {
    let samples = persist::load_spectrum_csv(path, log)?;
    coordinator
        .set_reference(kind, AveragedSpectrum::from_samples(samples, 1))
        .with_context(|| format!("importing {kind} reference from {}", path.display()))?;
    Ok(())
}
