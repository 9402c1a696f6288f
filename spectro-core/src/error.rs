//! Typed failures raised by the pipeline.
//!
//! File formats (config, CSV, model files) report through `anyhow` with
//! context instead; this enum covers the cases callers branch on.

use std::net::SocketAddr;

use thiserror::Error;

use crate::spectrum::ReferenceKind;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),
    #[error("failed to create UDP socket")]
    Socket(#[source] std::io::Error),
    #[error("failed to set socket option {option}")]
    SocketOption {
        option: &'static str,
        source: std::io::Error,
    },
    #[error("failed to bind UDP port {addr}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to create the receiver wakeup channel")]
    Wakeup(#[source] filedescriptor::Error),
    #[error("failed to spawn {0} thread")]
    Spawn(&'static str, #[source] std::io::Error),
    #[error("UDP receiving is already running")]
    AlreadyRunning,
    #[error("UDP receiving is not running")]
    NotReceiving,
    #[error("{0} reference accumulation is already running")]
    AlreadyAccumulating(ReferenceKind),
    #[error("{kind} reference has {actual} samples, expected {expected}")]
    ReferenceLength {
        kind: ReferenceKind,
        expected: usize,
        actual: usize,
    },
    #[error("invalid predictor index {0}")]
    PredictorIndex(usize),
    #[error("predictor {0} has no model loaded")]
    ModelNotLoaded(usize),
    #[error("prediction failed")]
    Prediction(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
