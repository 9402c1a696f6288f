// spectro-core/src/lib.rs

//! The core logic for the spectral ingest host.
//! This crate is responsible for receiving sensor packets over UDP,
//! batching and averaging them, black/white reference correction and
//! handing corrected spectra to a prediction backend. It is completely
//! headless and contains no display code.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod log_context;
pub mod persist;
pub mod predictor;
pub mod processor;
pub mod receiver;
pub mod reference;
pub mod spectrum;
pub mod trigger;
mod worker;

pub use config::PipelineConfig;
pub use coordinator::{SessionCoordinator, SessionEvent, SessionStats};
pub use error::{Error, Result};
pub use log_context::LogContext;
pub use spectrum::{AveragedSpectrum, ReferenceKind, Spectrum};
